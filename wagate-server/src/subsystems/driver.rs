//! Driver boundary — the external WhatsApp Web automation library.
//!
//! A driver owns one headless-browser-backed client. wagate never speaks the
//! WhatsApp protocol itself; pairing, encryption and transport all happen
//! behind this trait.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Lifecycle events forwarded verbatim from the automation library.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// Raw pairing payload to be rendered as a QR code.
    Qr(String),
    /// Pairing handshake finished; carries the library's session blob, if any.
    Authenticated { session: Option<serde_json::Value> },
    Ready,
    AuthFailure(String),
    Disconnected(String),
}

impl DriverEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DriverEvent::Qr(_) => "qr",
            DriverEvent::Authenticated { .. } => "authenticated",
            DriverEvent::Ready => "ready",
            DriverEvent::AuthFailure(_) => "auth_failure",
            DriverEvent::Disconnected(_) => "disconnected",
        }
    }
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Failed to launch automation client: {0}")]
    Launch(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Driver request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Driver connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// One automation client instance.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Launch the client. Returns once the library acknowledges the launch,
    /// not once paired. Lifecycle events are pushed into `events`.
    async fn launch(&self, events: mpsc::UnboundedSender<DriverEvent>) -> Result<(), DriverError>;

    /// Send `text` to an already-normalized chat id. Returns the serialized
    /// message id.
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, DriverError>;

    /// Release the browser and any file handles. Must tolerate repeat calls.
    async fn shutdown(&self) -> Result<(), DriverError>;
}

/// Creates drivers bound to a per-user isolated storage directory.
pub trait DriverFactory: Send + Sync {
    fn create(&self, user_id: Uuid, session_dir: &Path) -> Arc<dyn AutomationDriver>;

    /// Factory name for logging.
    fn name(&self) -> &str;
}
