//! Session Manager
//!
//! Orchestrates the client registry, the adapters and the session store:
//! - `initialize` / `restore_session` / `disconnect` create and tear down
//!   adapters, serialized per user id by an operation lock
//! - adapter events are applied by a single event loop: store first, then
//!   registry and adapter state, then re-emitted on the lifecycle broadcast
//! - events from a superseded adapter generation are dropped
//!
//! Readiness has one definition: a registry entry exists AND its adapter is in
//! the `Ready` state.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;
use wagate_core::config::SessionsConfig;
use wagate_core::{SessionStore, StatusUpdate, WagateError};

use super::adapter::{AdapterError, AdapterEvent, ClientAdapter, ClientState};
use super::driver::{DriverEvent, DriverFactory};
use super::qr;
use super::registry::{ClientRegistry, KeyedLocks};

const LIFECYCLE_CAPACITY: usize = 256;

// ============================================================================
// Errors / settings / events
// ============================================================================

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to initialize WhatsApp client: {0}")]
    ClientInit(String),

    #[error("No saved WhatsApp session for this user")]
    NoSessionData,

    #[error("WhatsApp authentication failed: {0}")]
    AuthFailure(String),

    #[error("WhatsApp session restore timed out after {0:?}")]
    RestoreTimeout(Duration),

    #[error("QR code not found")]
    QrNotFound,

    #[error("WhatsApp client not ready")]
    ClientNotReady,

    #[error("Invalid recipient number: {0:?}")]
    InvalidRecipient(String),

    #[error("Failed to send message: {0}")]
    Send(String),

    #[error("Store error: {0}")]
    Store(#[from] WagateError),
}

impl From<AdapterError> for SessionError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::ClientNotReady | AdapterError::Destroyed | AdapterError::AlreadyStarted => {
                SessionError::ClientNotReady
            }
            AdapterError::InvalidRecipient(r) => SessionError::InvalidRecipient(r),
            AdapterError::Send(e) => SessionError::Send(e.to_string()),
            AdapterError::Launch(e) => SessionError::ClientInit(e.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub root_dir: PathBuf,
    pub restore_timeout: Duration,
}

impl From<&SessionsConfig> for SessionSettings {
    fn from(config: &SessionsConfig) -> Self {
        Self {
            root_dir: config.root_dir.clone(),
            restore_timeout: Duration::from_secs(config.restore_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleKind {
    Qr { qr_code: String },
    Authenticated,
    Ready,
    AuthFailure { message: String },
    Disconnected { reason: String },
}

/// Lifecycle event re-emitted after it has been persisted.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub user_id: Uuid,
    #[serde(flatten)]
    pub kind: LifecycleKind,
}

// ============================================================================
// SessionManager
// ============================================================================

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    factory: Arc<dyn DriverFactory>,
    settings: SessionSettings,
    registry: ClientRegistry,
    /// Serializes initialize / restore / disconnect per user.
    op_locks: KeyedLocks,
    /// Serializes event application against teardown per user.
    state_locks: KeyedLocks,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    next_generation: AtomicU64,
}

impl SessionManager {
    /// Build the manager and spawn its event loop. Must be called inside a
    /// Tokio runtime.
    pub fn new(
        store: Arc<dyn SessionStore>,
        factory: Arc<dyn DriverFactory>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<AdapterEvent>();
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CAPACITY);

        let manager = Arc::new(Self {
            store,
            factory,
            settings,
            registry: ClientRegistry::new(),
            op_locks: KeyedLocks::new(),
            state_locks: KeyedLocks::new(),
            events_tx,
            lifecycle_tx,
            next_generation: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.apply_event(event).await;
            }
            tracing::debug!("Session event loop exiting");
        });

        tracing::info!(
            driver = manager.factory.name(),
            store = manager.store.name(),
            root_dir = %manager.settings.root_dir.display(),
            "Session manager started"
        );
        manager
    }

    /// Receive lifecycle events after they have been persisted.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    pub fn session_dir(&self, user_id: Uuid) -> PathBuf {
        self.settings.root_dir.join(user_id.to_string())
    }

    /// Start a fresh pairing flow. Any live client and any saved session
    /// artifacts for `user_id` are discarded first.
    pub async fn initialize(&self, user_id: Uuid, phone_number: &str) -> Result<(), SessionError> {
        let _op = self.op_locks.lock(user_id).await;
        tracing::info!(user_id = %user_id, phone_number, "Initializing WhatsApp client");

        self.teardown(user_id).await;

        let session_dir = self.session_dir(user_id);
        reset_session_dir(&session_dir).await.map_err(|e| {
            SessionError::ClientInit(format!(
                "cannot prepare session directory {}: {}",
                session_dir.display(),
                e
            ))
        })?;

        self.store
            .update_status(user_id, StatusUpdate::signed_out())
            .await?;

        let adapter = self.register(user_id, &session_dir).await;
        if let Err(e) = adapter.start(self.events_tx.clone()).await {
            tracing::error!(user_id = %user_id, error = %e, "WhatsApp client failed to start");
            self.discard(&adapter).await;
            return Err(SessionError::ClientInit(e.to_string()));
        }

        Ok(())
    }

    /// Revive a previously paired client from its on-disk session without a
    /// new QR scan. Waits for `ready`, an auth failure, or the restore timeout;
    /// on any failure the new client is torn down before returning.
    pub async fn restore_session(
        &self,
        user_id: Uuid,
        phone_number: &str,
    ) -> Result<Arc<ClientAdapter>, SessionError> {
        let _op = self.op_locks.lock(user_id).await;
        tracing::info!(user_id = %user_id, phone_number, "Restoring WhatsApp session");

        self.teardown(user_id).await;

        let session_dir = self.session_dir(user_id);
        if !has_session_artifacts(&session_dir).await {
            return Err(SessionError::NoSessionData);
        }

        let adapter = self.register(user_id, &session_dir).await;
        let mut state_rx = adapter.watch_state();

        if let Err(e) = adapter.start(self.events_tx.clone()).await {
            tracing::error!(user_id = %user_id, error = %e, "WhatsApp client failed to start during restore");
            self.discard(&adapter).await;
            return Err(SessionError::ClientInit(e.to_string()));
        }

        let timeout = self.settings.restore_timeout;
        let settled = tokio::time::timeout(timeout, async {
            state_rx
                .wait_for(|s| *s == ClientState::Ready || s.is_terminal())
                .await
                .map(|s| *s)
        })
        .await;

        let err = match settled {
            Ok(Ok(ClientState::Ready)) => {
                tracing::info!(user_id = %user_id, "WhatsApp session restored");
                return Ok(adapter);
            }
            Ok(Ok(ClientState::AuthFailed)) => {
                SessionError::AuthFailure("saved session was rejected".to_string())
            }
            Ok(Ok(state)) => SessionError::AuthFailure(format!("client ended in state {:?}", state)),
            Ok(Err(_)) => SessionError::AuthFailure("client state channel closed".to_string()),
            Err(_) => SessionError::RestoreTimeout(timeout),
        };

        tracing::warn!(user_id = %user_id, error = %err, "WhatsApp session restore failed");
        self.discard(&adapter).await;
        Err(err)
    }

    /// Latest pairing QR code. Not found when no client is registered, no QR
    /// has been produced yet, or the client is already paired.
    pub async fn get_qr_code(&self, user_id: Uuid) -> Result<String, SessionError> {
        let adapter = self
            .registry
            .adapter(user_id)
            .await
            .ok_or(SessionError::QrNotFound)?;
        if adapter.state().is_paired() {
            return Err(SessionError::QrNotFound);
        }
        self.registry
            .qr_code(user_id)
            .await
            .ok_or(SessionError::QrNotFound)
    }

    /// Idempotent logout: tear down any live client and mark the record
    /// signed out. Store failures are logged, never raised.
    pub async fn disconnect(&self, user_id: Uuid) {
        let _op = self.op_locks.lock(user_id).await;

        let had_client = self.teardown(user_id).await;

        if let Err(e) = self
            .store
            .update_status(user_id, StatusUpdate::signed_out())
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to persist logout");
        }

        tracing::info!(user_id = %user_id, had_client, "WhatsApp client disconnected");
    }

    pub async fn is_ready(&self, user_id: Uuid) -> bool {
        self.registry
            .adapter(user_id)
            .await
            .map(|a| a.is_ready())
            .unwrap_or(false)
    }

    pub async fn client_state(&self, user_id: Uuid) -> Option<ClientState> {
        self.registry.adapter(user_id).await.map(|a| a.state())
    }

    pub async fn live_clients(&self) -> usize {
        self.registry.len().await
    }

    /// Send through the user's live client and bump `last_active`.
    pub async fn send_message(
        &self,
        user_id: Uuid,
        recipient: &str,
        text: &str,
    ) -> Result<String, SessionError> {
        let adapter = self
            .registry
            .adapter(user_id)
            .await
            .ok_or(SessionError::ClientNotReady)?;

        let message_id = adapter.send_message(recipient, text).await?;

        if let Err(e) = self.store.touch(user_id).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to update last_active");
        }
        tracing::info!(user_id = %user_id, message_id = %message_id, "Message sent");
        Ok(message_id)
    }

    /// Destroy every live client on process exit. Records are left as-is so the
    /// next boot can restore them.
    pub async fn shutdown(&self) {
        let adapters = self.registry.drain().await;
        let count = adapters.len();
        futures::future::join_all(adapters.iter().map(|a| a.destroy())).await;
        tracing::info!(count, "Destroyed all WhatsApp clients");
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn register(&self, user_id: Uuid, session_dir: &Path) -> Arc<ClientAdapter> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let driver = self.factory.create(user_id, session_dir);
        let adapter = Arc::new(ClientAdapter::new(user_id, generation, driver));

        let previous = {
            let _state = self.state_locks.lock(user_id).await;
            self.registry.insert(adapter.clone()).await
        };
        if let Some(previous) = previous {
            previous.adapter.destroy().await;
        }
        adapter
    }

    /// Remove and destroy whatever client is registered. Returns whether one was.
    async fn teardown(&self, user_id: Uuid) -> bool {
        let removed = {
            let _state = self.state_locks.lock(user_id).await;
            self.registry.remove(user_id).await
        };
        match removed {
            Some(entry) => {
                entry.adapter.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Destroy `adapter`, unregistering it only if it is still current.
    async fn discard(&self, adapter: &Arc<ClientAdapter>) {
        {
            let _state = self.state_locks.lock(adapter.user_id()).await;
            self.registry
                .remove_if_current(adapter.user_id(), adapter.generation())
                .await;
        }
        adapter.destroy().await;
    }

    async fn persist(&self, user_id: Uuid, update: StatusUpdate) {
        if let Err(e) = self.store.update_status(user_id, update).await {
            tracing::error!(user_id = %user_id, error = %e, "Failed to persist session status");
        }
    }

    async fn apply_event(&self, event: AdapterEvent) {
        let AdapterEvent {
            user_id,
            generation,
            event,
        } = event;

        let _state = self.state_locks.lock(user_id).await;

        let Some(adapter) = self.registry.current(user_id, generation).await else {
            tracing::debug!(
                user_id = %user_id,
                generation,
                event = event.name(),
                "Dropping event from superseded client"
            );
            return;
        };

        let kind = match &event {
            DriverEvent::Qr(payload) => {
                let qr_code = match qr::render_data_url(payload) {
                    Ok(url) => url,
                    Err(e) => {
                        tracing::error!(user_id = %user_id, error = %e, "QR generation failed");
                        return;
                    }
                };
                self.persist(user_id, StatusUpdate::authenticated(false).touched())
                    .await;
                self.registry
                    .set_qr_code(user_id, generation, qr_code.clone())
                    .await;
                LifecycleKind::Qr { qr_code }
            }
            DriverEvent::Authenticated { session } => {
                let mut update = StatusUpdate::authenticated(true).touched();
                if let Some(blob) = session {
                    update = update.with_session_data(Some(blob.to_string()));
                }
                self.persist(user_id, update).await;
                LifecycleKind::Authenticated
            }
            DriverEvent::Ready => {
                self.persist(user_id, StatusUpdate::authenticated(true).touched())
                    .await;
                LifecycleKind::Ready
            }
            DriverEvent::AuthFailure(message) => {
                self.persist(user_id, StatusUpdate::signed_out().touched())
                    .await;
                self.registry.remove_if_current(user_id, generation).await;
                LifecycleKind::AuthFailure {
                    message: message.clone(),
                }
            }
            DriverEvent::Disconnected(reason) => {
                self.persist(user_id, StatusUpdate::signed_out().touched())
                    .await;
                self.registry.remove_if_current(user_id, generation).await;
                LifecycleKind::Disconnected {
                    reason: reason.clone(),
                }
            }
        };

        let state = adapter.advance(&event);
        if state.is_terminal() {
            // Off the event loop
            tokio::spawn(async move { adapter.destroy().await });
        }

        tracing::info!(
            user_id = %user_id,
            generation,
            event = event.name(),
            state = ?state,
            "Client lifecycle event"
        );
        // No subscribers is fine
        let _ = self.lifecycle_tx.send(LifecycleEvent { user_id, kind });
    }
}

async fn reset_session_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

async fn has_session_artifacts(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}
