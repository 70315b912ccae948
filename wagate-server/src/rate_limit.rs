//! Request throttling for the send endpoint.
//!
//! `RateLimiter` is the pluggable seam; the HTTP layer only sees the trait.
//! The shipped policy is a fixed window per key (the authenticated user id).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use wagate_core::config::RateLimitConfig;

use crate::auth::AuthenticatedUser;
use crate::http::HttpState;

/// Prune expired windows once the map grows past this many keys.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str) -> RateDecision;

    fn name(&self) -> &str;
}

/// Never limits. Used when `rate_limit.enabled = false`.
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn check(&self, _key: &str) -> RateDecision {
        RateDecision::Allowed
    }

    fn name(&self) -> &str {
        "unlimited"
    }
}

struct Window {
    started: Instant,
    count: u32,
}

pub struct FixedWindowLimiter {
    window: Duration,
    max_requests: u32,
    buckets: Mutex<HashMap<String, Window>>,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let Ok(mut buckets) = self.buckets.lock() else {
            tracing::error!("Rate limiter state poisoned, allowing request");
            return RateDecision::Allowed;
        };

        if buckets.len() > PRUNE_THRESHOLD {
            let window = self.window;
            buckets.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = buckets.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        let elapsed = now.duration_since(entry.started);
        if elapsed >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.max_requests {
            let retry_after = self.window.saturating_sub(now.duration_since(entry.started));
            RateDecision::Limited { retry_after }
        } else {
            entry.count += 1;
            RateDecision::Allowed
        }
    }

    fn name(&self) -> &str {
        "fixed-window"
    }
}

pub fn from_config(config: &RateLimitConfig) -> Arc<dyn RateLimiter> {
    if !config.enabled {
        return Arc::new(Unlimited);
    }
    Arc::new(FixedWindowLimiter::new(
        Duration::from_secs(config.window_seconds),
        config.max_requests,
    ))
}

/// Axum middleware. Must run after `auth::require_api_key`, which provides the
/// key; requests without an authenticated user pass through untouched.
pub async fn enforce_rate_limit(
    State(state): State<Arc<HttpState>>,
    request: Request,
    next: Next,
) -> Response {
    let key = match request.extensions().get::<AuthenticatedUser>() {
        Some(user) => user.0.id.to_string(),
        None => return next.run(request).await,
    };

    match state.limiter.check(&key) {
        RateDecision::Allowed => next.run(request).await,
        RateDecision::Limited { retry_after } => {
            tracing::warn!(user_id = %key, limiter = state.limiter.name(), "Rate limit exceeded");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "error": "Too many messages sent. Please try again later."
                })),
            )
                .into_response();
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}
