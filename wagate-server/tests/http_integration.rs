//! HTTP integration tests for the wagate REST API.
//!
//! Full end-to-end handler dispatch through `build_router` with Axum
//! `oneshot`: real middleware, in-memory store, fake automation driver.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{harness, next_event, Harness};
use serde_json::{json, Value};
use tower::ServiceExt;
use wagate_core::{SessionStore, StatusUpdate};
use wagate_server::auth::{API_KEY_HEADER, NOT_AUTHENTICATED};
use wagate_server::http::{build_router, HttpState};
use wagate_server::rate_limit::{FixedWindowLimiter, RateLimiter, Unlimited};
use wagate_server::subsystems::DriverEvent;

const PHONE: &str = "+15551234567";

fn app_with(h: &Harness, limiter: Arc<dyn RateLimiter>) -> Router {
    build_router(Arc::new(HttpState {
        store: h.store.clone(),
        sessions: h.sessions.clone(),
        limiter,
    }))
}

fn app(h: &Harness) -> Router {
    app_with(h, Arc::new(Unlimited))
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, body: Value, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header(API_KEY_HEADER, key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn send_body() -> Value {
    json!({ "recipientNumber": "15557654321", "message": "hello" })
}

/// Initialize over HTTP and drive the fake client to ready.
async fn paired_user(h: &Harness, app: &Router) -> (String, String) {
    let mut events = h.sessions.subscribe();
    let (status, body) = call(
        app,
        post_json("/api/auth/initialize", json!({ "phoneNumber": PHONE }), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let user_id = body["userId"].as_str().unwrap().to_string();
    let api_key = body["apiKey"].as_str().unwrap().to_string();

    let id = user_id.parse().unwrap();
    let driver = h.factory.latest(id);
    driver.emit(DriverEvent::Authenticated { session: None });
    next_event(&mut events, id).await;
    driver.emit(DriverEvent::Ready);
    next_event(&mut events, id).await;
    (user_id, api_key)
}

// ===========================================================================
// TEST 1: GET /health and GET /version
// ===========================================================================
#[tokio::test]
async fn test_health_and_version() {
    let h = harness(Duration::from_secs(5));
    let app = app(&h);

    let (status, body) = call(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["liveClients"], 0);

    let (status, body) = call(&app, get("/version")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["protocol"], "wagate/1");
}

// ===========================================================================
// TEST 2: initialize returns userId + apiKey; same phone keeps its key
// ===========================================================================
#[tokio::test]
async fn test_initialize_is_stable_per_phone() {
    let h = harness(Duration::from_secs(5));
    let app = app(&h);

    let req = || post_json("/api/auth/initialize", json!({ "phoneNumber": PHONE }), None);
    let (status, first) = call(&app, req()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["message"], "Scan QR code to authenticate");
    assert_eq!(first["apiKey"].as_str().unwrap().len(), 64);

    let (_, second) = call(&app, req()).await;
    assert_eq!(first["userId"], second["userId"]);
    assert_eq!(first["apiKey"], second["apiKey"]);
    assert_eq!(h.sessions.live_clients().await, 1);
}

// ===========================================================================
// TEST 3: initialize rejects missing phone and malformed JSON with 400
// ===========================================================================
#[tokio::test]
async fn test_initialize_bad_requests() {
    let h = harness(Duration::from_secs(5));
    let app = app(&h);

    let (status, body) = call(&app, post_json("/api/auth/initialize", json!({}), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Phone number is required");

    let req = Request::builder()
        .method("POST")
        .uri("/api/auth/initialize")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

// ===========================================================================
// TEST 4: initialize returns 500 when the client cannot launch
// ===========================================================================
#[tokio::test]
async fn test_initialize_launch_failure() {
    let h = harness(Duration::from_secs(5));
    h.factory.fail_launches(true);
    let app = app(&h);

    let (status, body) = call(
        &app,
        post_json("/api/auth/initialize", json!({ "phoneNumber": PHONE }), None),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to initialize session");
}

// ===========================================================================
// TEST 5: QR endpoint — 404 before the first QR, data URL after
// ===========================================================================
#[tokio::test]
async fn test_qr_code_flow() {
    let h = harness(Duration::from_secs(5));
    let app = app(&h);
    let mut events = h.sessions.subscribe();

    let (_, body) = call(
        &app,
        post_json("/api/auth/initialize", json!({ "phoneNumber": PHONE }), None),
    )
    .await;
    let user_id = body["userId"].as_str().unwrap().to_string();
    let uri = format!("/api/auth/qr-code/{}", user_id);

    let (status, body) = call(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "QR code not found");

    let id = user_id.parse().unwrap();
    h.factory.latest(id).emit(DriverEvent::Qr("2@ref,key,secret".to_string()));
    next_event(&mut events, id).await;

    let (status, body) = call(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["qrCode"].as_str().unwrap().starts_with("data:image/"));

    let (status, _) = call(&app, get("/api/auth/qr-code/not-a-uuid")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ===========================================================================
// TEST 6: send requires an API key (401) and a valid one (401)
// ===========================================================================
#[tokio::test]
async fn test_send_rejects_missing_and_bad_keys() {
    let h = harness(Duration::from_secs(5));
    let app = app(&h);

    let (status, body) = call(&app, post_json("/api/messages/send", send_body(), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "API key is required");

    let (status, body) = call(
        &app,
        post_json("/api/messages/send", send_body(), Some("deadbeef")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid API key");
}

// ===========================================================================
// TEST 7: flagged-authenticated record with no live client → 403, flag reset
// ===========================================================================
#[tokio::test]
async fn test_send_reconciles_stale_flag() {
    let h = harness(Duration::from_secs(5));
    let app = app(&h);
    let user = h.store.find_or_create(PHONE).await.unwrap();
    h.store
        .update_status(user.id, StatusUpdate::authenticated(true))
        .await
        .unwrap();

    let (status, body) = call(
        &app,
        post_json("/api/messages/send", send_body(), Some(&user.api_key)),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], NOT_AUTHENTICATED);
    assert!(!h.store.find_by_id(user.id).await.unwrap().unwrap().is_authenticated);
}

// ===========================================================================
// TEST 8: full flow — initialize, pair, send, logout, send again is 403
// ===========================================================================
#[tokio::test]
async fn test_full_flow() {
    let h = harness(Duration::from_secs(5));
    let app = app(&h);
    let (user_id, api_key) = paired_user(&h, &app).await;

    let (status, body) = call(
        &app,
        post_json("/api/messages/send", send_body(), Some(&api_key)),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {}", body);
    assert_eq!(body["success"], true);
    assert!(body["messageId"].is_string());
    let driver = h.factory.latest(user_id.parse().unwrap());
    assert_eq!(driver.sent()[0].0, "15557654321@c.us");

    // Paired clients no longer expose a QR code
    let (status, _) = call(&app, get(&format!("/api/auth/qr-code/{}", user_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let logout = || {
        Request::builder()
            .method("POST")
            .uri(format!("/api/auth/logout/{}", user_id))
            .body(Body::empty())
            .unwrap()
    };
    let (status, body) = call(&app, logout()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Logged out successfully");
    let (status, _) = call(&app, logout()).await;
    assert_eq!(status, StatusCode::OK, "logout is idempotent");

    let (status, _) = call(
        &app,
        post_json("/api/messages/send", send_body(), Some(&api_key)),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// ===========================================================================
// TEST 9: send validates its body after auth
// ===========================================================================
#[tokio::test]
async fn test_send_missing_fields() {
    let h = harness(Duration::from_secs(5));
    let app = app(&h);
    let (_, api_key) = paired_user(&h, &app).await;

    let (status, body) = call(
        &app,
        post_json(
            "/api/messages/send",
            json!({ "recipientNumber": "15557654321" }),
            Some(&api_key),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Recipient number and message are required");
}

// ===========================================================================
// TEST 10: rate limiter returns 429 once the window budget is spent
// ===========================================================================
#[tokio::test]
async fn test_send_rate_limited() {
    let h = harness(Duration::from_secs(5));
    let app = app_with(
        &h,
        Arc::new(FixedWindowLimiter::new(Duration::from_secs(60), 2)),
    );
    let (_, api_key) = paired_user(&h, &app).await;

    for _ in 0..2 {
        let (status, _) = call(
            &app,
            post_json("/api/messages/send", send_body(), Some(&api_key)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let resp = app
        .clone()
        .oneshot(post_json("/api/messages/send", send_body(), Some(&api_key)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("retry-after"));
}

// ===========================================================================
// TEST 11: logout with a malformed id is a 400
// ===========================================================================
#[tokio::test]
async fn test_logout_invalid_id() {
    let h = harness(Duration::from_secs(5));
    let app = app(&h);

    let req = Request::builder()
        .method("POST")
        .uri("/api/auth/logout/not-a-uuid")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid user id");
}

// ===========================================================================
// TEST 12: authenticated-but-not-ready client → 403 without losing the flag
// ===========================================================================
#[tokio::test]
async fn test_send_before_ready_keeps_flag() {
    let h = harness(Duration::from_secs(5));
    let app = app(&h);
    let mut events = h.sessions.subscribe();

    let (_, body) = call(
        &app,
        post_json("/api/auth/initialize", json!({ "phoneNumber": PHONE }), None),
    )
    .await;
    let id = body["userId"].as_str().unwrap().parse().unwrap();
    let api_key = body["apiKey"].as_str().unwrap().to_string();

    let driver = h.factory.latest(id);
    driver.emit(DriverEvent::Authenticated { session: None });
    next_event(&mut events, id).await;

    let (status, body) = call(
        &app,
        post_json("/api/messages/send", send_body(), Some(&api_key)),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], NOT_AUTHENTICATED);
    assert!(
        h.store.find_by_id(id).await.unwrap().unwrap().is_authenticated,
        "a live paired client must keep its flag"
    );

    driver.emit(DriverEvent::Ready);
    next_event(&mut events, id).await;
    let (status, _) = call(
        &app,
        post_json("/api/messages/send", send_body(), Some(&api_key)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}
