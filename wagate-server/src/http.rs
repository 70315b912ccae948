//! wagate HTTP REST API
//!
//! Axum-based HTTP server exposing WhatsApp session pairing and message sending.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to a pure
//! inner function returning `(StatusCode, serde_json::Value)`. The inner
//! functions are directly testable without axum dispatch machinery.
//!
//! Endpoints:
//! - POST /api/auth/initialize          — register a phone number, start pairing
//! - GET  /api/auth/qr-code/:userId     — latest pairing QR code (data URL)
//! - POST /api/auth/logout/:userId      — tear down the client, sign out
//! - POST /api/messages/send            — send a text (x-api-key, rate limited)
//! - GET  /health                       — store health + live client count
//! - GET  /version                      — server version info
//!
//! Every failure body is `{"error": "<message>"}`.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;
use wagate_core::config::HttpConfig;
use wagate_core::{SessionStore, UserRecord};

use crate::auth::{self, AuthenticatedUser, NOT_AUTHENTICATED};
use crate::rate_limit::{self, RateLimiter};
use crate::subsystems::{SessionError, SessionManager};

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub store: Arc<dyn SessionStore>,
    pub sessions: Arc<SessionManager>,
    pub limiter: Arc<dyn RateLimiter>,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    // Layers run outermost-last: auth first, then the rate limiter
    let messages = Router::new()
        .route("/send", post(send_message_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::enforce_rate_limit,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/api/auth/initialize", post(initialize_handler))
        .route("/api/auth/qr-code/:user_id", get(qr_code_handler))
        .route("/api/auth/logout/:user_id", post(logout_handler))
        .nest("/api/messages", messages)
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    config: &HttpConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("wagate HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    pub phone_number: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub recipient_number: Option<String>,
    pub message: Option<String>,
}

pub fn error_body(msg: impl Into<String>) -> serde_json::Value {
    serde_json::json!({ "error": msg.into() })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check — asks the store and reports live clients.
pub async fn health_inner(state: &HttpState) -> (StatusCode, serde_json::Value) {
    match state.store.health_check().await {
        Ok(store) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "store": store,
                "liveClients": state.sessions.live_clients().await,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

/// Inner version — returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "wagate/1",
    })
}

/// Inner initialize — finds or creates the record and starts a pairing flow.
pub async fn initialize_inner(
    state: &HttpState,
    req: InitializeRequest,
) -> (StatusCode, serde_json::Value) {
    let phone_number = match non_blank(req.phone_number) {
        Some(p) => p,
        None => return (StatusCode::BAD_REQUEST, error_body("Phone number is required")),
    };

    let user = match state.store.find_or_create(&phone_number).await {
        Ok(u) => u,
        Err(e) => {
            tracing::error!(error = %e, "Session initialization error");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("Failed to initialize session"),
            );
        }
    };

    if let Err(e) = state.sessions.initialize(user.id, &phone_number).await {
        tracing::error!(user_id = %user.id, error = %e, "Session initialization error");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("Failed to initialize session"),
        );
    }

    (
        StatusCode::OK,
        serde_json::json!({
            "userId": user.id,
            "apiKey": user.api_key,
            "message": "Scan QR code to authenticate",
        }),
    )
}

/// Inner QR lookup. Unknown or malformed ids are simply "not found".
pub async fn qr_code_inner(state: &HttpState, user_id: &str) -> (StatusCode, serde_json::Value) {
    let not_found = || (StatusCode::NOT_FOUND, error_body("QR code not found"));

    let Ok(user_id) = Uuid::parse_str(user_id) else {
        return not_found();
    };

    match state.sessions.get_qr_code(user_id).await {
        Ok(qr_code) => (StatusCode::OK, serde_json::json!({ "qrCode": qr_code })),
        Err(_) => not_found(),
    }
}

/// Inner logout — idempotent.
pub async fn logout_inner(state: &HttpState, user_id: &str) -> (StatusCode, serde_json::Value) {
    let Ok(user_id) = Uuid::parse_str(user_id) else {
        return (StatusCode::BAD_REQUEST, error_body("Invalid user id"));
    };

    state.sessions.disconnect(user_id).await;
    (
        StatusCode::OK,
        serde_json::json!({ "message": "Logged out successfully" }),
    )
}

/// Inner send — `user` has already passed the API key middleware.
pub async fn send_message_inner(
    state: &HttpState,
    user: &UserRecord,
    req: SendMessageRequest,
) -> (StatusCode, serde_json::Value) {
    let (recipient, message) = match (non_blank(req.recipient_number), req.message) {
        (Some(r), Some(m)) if !m.trim().is_empty() => (r, m),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("Recipient number and message are required"),
            )
        }
    };

    match state.sessions.send_message(user.id, &recipient, &message).await {
        Ok(message_id) => (
            StatusCode::OK,
            serde_json::json!({ "success": true, "messageId": message_id }),
        ),
        Err(SessionError::ClientNotReady) => (StatusCode::FORBIDDEN, error_body(NOT_AUTHENTICATED)),
        Err(SessionError::InvalidRecipient(_)) => {
            (StatusCode::BAD_REQUEST, error_body("Invalid recipient number"))
        }
        Err(e) => {
            tracing::error!(user_id = %user.id, error = %e, "Message sending error");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))
        }
    }
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

fn invalid_body(rejection: JsonRejection) -> (StatusCode, Json<serde_json::Value>) {
    tracing::debug!(error = %rejection, "Rejected request body");
    (StatusCode::BAD_REQUEST, Json(error_body("Invalid JSON body")))
}

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn initialize_handler(
    State(state): State<Arc<HttpState>>,
    body: Result<Json<InitializeRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return invalid_body(rejection),
    };
    let (status, body) = initialize_inner(&state, req).await;
    (status, Json(body))
}

pub async fn qr_code_handler(
    State(state): State<Arc<HttpState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = qr_code_inner(&state, &user_id).await;
    (status, Json(body))
}

pub async fn logout_handler(
    State(state): State<Arc<HttpState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = logout_inner(&state, &user_id).await;
    (status, Json(body))
}

pub async fn send_message_handler(
    State(state): State<Arc<HttpState>>,
    Extension(AuthenticatedUser(user)): Extension<AuthenticatedUser>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return invalid_body(rejection),
    };
    let (status, body) = send_message_inner(&state, &user, req).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests — call inner functions directly
// ============================================================================
