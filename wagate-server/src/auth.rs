//! API key middleware for the message endpoints.
//!
//! A request passes only if its `x-api-key` resolves to a record that is
//! flagged authenticated AND has a live, ready client in the registry. When
//! the flag says authenticated but no live client is registered, the flag is
//! reset.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use wagate_core::{StatusUpdate, UserRecord};

use crate::http::{error_body, HttpState};

pub const API_KEY_HEADER: &str = "x-api-key";

pub const NOT_AUTHENTICATED: &str =
    "WhatsApp client not authenticated. Please reinitialize and scan QR code.";

/// The resolved record, attached to request extensions on success.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub UserRecord);

/// Inner auth check: resolves the key or returns `(status, json_body)`.
pub async fn authenticate_inner(
    state: &HttpState,
    api_key: Option<&str>,
) -> Result<UserRecord, (StatusCode, serde_json::Value)> {
    let api_key = match api_key {
        Some(k) if !k.is_empty() => k,
        _ => return Err((StatusCode::UNAUTHORIZED, error_body("API key is required"))),
    };

    let user = match state.store.find_by_api_key(api_key).await {
        Ok(Some(user)) => user,
        Ok(None) => return Err((StatusCode::UNAUTHORIZED, error_body("Invalid API key"))),
        Err(e) => {
            tracing::error!(error = %e, "API key lookup failed");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("Authentication failed"),
            ));
        }
    };

    if user.is_authenticated && state.sessions.is_ready(user.id).await {
        return Ok(user);
    }

    // Authenticated-but-not-ready clients keep the flag
    let drifted = match state.sessions.client_state(user.id).await {
        None => true,
        Some(client) => client.is_terminal(),
    };
    if user.is_authenticated && drifted {
        tracing::warn!(user_id = %user.id, "Record flagged authenticated without a live client, resetting");
        if let Err(e) = state
            .store
            .update_status(user.id, StatusUpdate::authenticated(false))
            .await
        {
            tracing::error!(user_id = %user.id, error = %e, "Failed to reset authentication flag");
        }
    }
    Err((StatusCode::FORBIDDEN, error_body(NOT_AUTHENTICATED)))
}

pub async fn require_api_key(
    State(state): State<Arc<HttpState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match authenticate_inner(&state, api_key.as_deref()).await {
        Ok(user) => {
            request.extensions_mut().insert(AuthenticatedUser(user));
            next.run(request).await
        }
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}
