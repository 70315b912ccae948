//! Automation Client Adapter
//!
//! Wraps exactly one `AutomationDriver` for one user. The adapter owns the
//! per-instance state machine and forwards driver events, tagged with the
//! user id and adapter generation, to the session manager.
//!
//! State transitions are applied by the manager (via `advance`) only after the
//! matching store mutation has been persisted, so an observer that sees
//! `Ready` can rely on the record already saying `is_authenticated = true`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::driver::{AutomationDriver, DriverError, DriverEvent};

/// Addressing suffix for one-to-one chats.
pub const CHAT_SUFFIX: &str = "@c.us";

// ============================================================================
// State machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Uninitialized,
    Pairing,
    Authenticated,
    Ready,
    AuthFailed,
    Disconnected,
}

impl ClientState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ClientState::AuthFailed | ClientState::Disconnected)
    }

    /// Pairing handshake completed (a QR code is no longer meaningful).
    pub fn is_paired(self) -> bool {
        matches!(self, ClientState::Authenticated | ClientState::Ready)
    }

    /// Transition for `event`. Terminal states absorb everything; events
    /// before `start` are ignored except a disconnect.
    pub fn on_event(self, event: &DriverEvent) -> ClientState {
        use ClientState::*;

        if self.is_terminal() {
            return self;
        }
        match (self, event) {
            (_, DriverEvent::Disconnected(_)) => Disconnected,
            (Uninitialized, _) => Uninitialized,
            (_, DriverEvent::AuthFailure(_)) => AuthFailed,
            (_, DriverEvent::Qr(_)) => Pairing,
            (Ready, DriverEvent::Authenticated { .. }) => Ready,
            (_, DriverEvent::Authenticated { .. }) => Authenticated,
            (_, DriverEvent::Ready) => Ready,
        }
    }
}

// ============================================================================
// Errors / events
// ============================================================================

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("WhatsApp client is not ready")]
    ClientNotReady,

    #[error("Invalid recipient number: {0:?}")]
    InvalidRecipient(String),

    #[error("Failed to send message: {0}")]
    Send(#[source] DriverError),

    #[error("Failed to start client: {0}")]
    Launch(#[source] DriverError),

    #[error("Client already started")]
    AlreadyStarted,

    #[error("Client has been destroyed")]
    Destroyed,
}

/// A driver event attributed to a specific adapter instance.
#[derive(Debug, Clone)]
pub struct AdapterEvent {
    pub user_id: Uuid,
    pub generation: u64,
    pub event: DriverEvent,
}

/// Normalize a recipient into the transport's chat id form.
///
/// Ids already carrying the `@c.us` suffix pass through; anything else is
/// reduced to its digits. Returns `None` when no digits remain.
pub fn format_recipient(recipient: &str) -> Option<String> {
    let trimmed = recipient.trim();
    if trimmed.contains(CHAT_SUFFIX) {
        return Some(trimmed.to_string());
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(format!("{}{}", digits, CHAT_SUFFIX))
    }
}

// ============================================================================
// ClientAdapter
// ============================================================================

pub struct ClientAdapter {
    user_id: Uuid,
    generation: u64,
    driver: Arc<dyn AutomationDriver>,
    state: watch::Sender<ClientState>,
    destroyed: AtomicBool,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClientAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAdapter")
            .field("user_id", &self.user_id)
            .field("generation", &self.generation)
            .field("state", &*self.state.borrow())
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl ClientAdapter {
    pub fn new(
        user_id: Uuid,
        generation: u64,
        driver: Arc<dyn AutomationDriver>,
    ) -> Self {
        let (state, _) = watch::channel(ClientState::Uninitialized);
        Self {
            user_id,
            generation,
            driver,
            state,
            destroyed: AtomicBool::new(false),
            pump: std::sync::Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Apply `event` to the state machine and return the resulting state.
    pub(crate) fn advance(&self, event: &DriverEvent) -> ClientState {
        let mut next = ClientState::Uninitialized;
        self.state.send_modify(|s| {
            *s = s.on_event(event);
            next = *s;
        });
        next
    }

    /// Launch the driver. Suspends until the library acknowledges the launch.
    pub async fn start(&self, events: mpsc::UnboundedSender<AdapterEvent>) -> Result<(), AdapterError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(AdapterError::Destroyed);
        }
        if self.state() != ClientState::Uninitialized {
            return Err(AdapterError::AlreadyStarted);
        }

        let (driver_tx, mut driver_rx) = mpsc::unbounded_channel::<DriverEvent>();
        let user_id = self.user_id;
        let generation = self.generation;
        let pump = tokio::spawn(async move {
            while let Some(event) = driver_rx.recv().await {
                tracing::debug!(user_id = %user_id, generation, event = event.name(), "Driver event");
                let tagged = AdapterEvent {
                    user_id,
                    generation,
                    event,
                };
                if events.send(tagged).is_err() {
                    break;
                }
            }
        });
        if let Ok(mut slot) = self.pump.lock() {
            *slot = Some(pump);
        }

        self.state.send_replace(ClientState::Pairing);
        self.driver
            .launch(driver_tx)
            .await
            .map_err(AdapterError::Launch)?;

        tracing::info!(user_id = %self.user_id, generation, "Automation client launched");
        Ok(())
    }

    pub async fn send_message(&self, recipient: &str, text: &str) -> Result<String, AdapterError> {
        if !self.is_ready() {
            return Err(AdapterError::ClientNotReady);
        }
        let chat_id = format_recipient(recipient)
            .ok_or_else(|| AdapterError::InvalidRecipient(recipient.to_string()))?;

        self.driver
            .send_text(&chat_id, text)
            .await
            .map_err(AdapterError::Send)
    }

    /// Release the driver. Repeat calls and never-started instances are no-ops.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut slot) = self.pump.lock() {
            if let Some(pump) = slot.take() {
                pump.abort();
            }
        }

        let was_started = self.state() != ClientState::Uninitialized;
        self.state.send_modify(|s| {
            if !s.is_terminal() {
                *s = ClientState::Disconnected;
            }
        });

        if was_started {
            if let Err(e) = self.driver.shutdown().await {
                tracing::warn!(user_id = %self.user_id, error = %e, "Driver shutdown failed");
            }
        }
        tracing::info!(user_id = %self.user_id, generation = self.generation, "Automation client destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// TESTS
// ============================================================================
