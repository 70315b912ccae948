//! Stdio bridge driver
//!
//! Runs the WhatsApp Web automation library in a child process (typically a
//! Node.js script around whatsapp-web.js and a headless Chromium), one process
//! per user, and talks to it with newline-delimited JSON:
//!
//! - wagate → bridge: `{"id":N,"method":"initialize"|"send_message"|"destroy","params":{..}}`
//! - bridge → wagate: lifecycle events `{"type":"qr","data":..}`,
//!   `{"type":"authenticated","session":..}`, `{"type":"ready"}`,
//!   `{"type":"auth_failure","message":..}`, `{"type":"disconnected","reason":..}`
//!   and replies `{"type":"response","id":N,"ok":bool,"result":{..},"error":..}`
//!
//! The child gets its identity and storage location through the environment
//! (`WAGATE_CLIENT_ID`, `WAGATE_SESSION_DIR`, `WAGATE_HEADLESS`,
//! `WAGATE_BROWSER_ARGS` as a JSON array). An unexpected exit of the child is
//! reported as `disconnected`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use uuid::Uuid;
use wagate_core::config::BridgeConfig;

use super::driver::{AutomationDriver, DriverError, DriverEvent, DriverFactory};

/// QR payloads and session blobs can be large; anything beyond this is garbage.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

const DESTROY_TIMEOUT: Duration = Duration::from_secs(10);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeMessage {
    Qr {
        data: String,
    },
    Authenticated {
        #[serde(default)]
        session: Option<Value>,
    },
    Ready,
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    Response {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
}

#[derive(Debug)]
struct Reply {
    ok: bool,
    result: Value,
    error: Option<String>,
}

enum Inbound {
    Event(DriverEvent),
    Reply(u64, Reply),
}

impl From<BridgeMessage> for Inbound {
    fn from(msg: BridgeMessage) -> Self {
        match msg {
            BridgeMessage::Qr { data } => Inbound::Event(DriverEvent::Qr(data)),
            BridgeMessage::Authenticated { session } => {
                Inbound::Event(DriverEvent::Authenticated { session })
            }
            BridgeMessage::Ready => Inbound::Event(DriverEvent::Ready),
            BridgeMessage::AuthFailure { message } => Inbound::Event(DriverEvent::AuthFailure(message)),
            BridgeMessage::Disconnected { reason } => Inbound::Event(DriverEvent::Disconnected(reason)),
            BridgeMessage::Response {
                id,
                ok,
                result,
                error,
            } => Inbound::Reply(id, Reply { ok, result, error }),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

pub struct BridgeDriverFactory {
    config: BridgeConfig,
}

impl BridgeDriverFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

impl From<&BridgeConfig> for BridgeDriverFactory {
    fn from(config: &BridgeConfig) -> Self {
        Self::new(config.clone())
    }
}

impl DriverFactory for BridgeDriverFactory {
    fn create(&self, user_id: Uuid, session_dir: &Path) -> Arc<dyn AutomationDriver> {
        Arc::new(BridgeDriver::new(user_id, session_dir, self.config.clone()))
    }

    fn name(&self) -> &str {
        "stdio-bridge"
    }
}

// ============================================================================
// Driver
// ============================================================================

struct BridgeProcess {
    child: Child,
    writer: FramedWrite<ChildStdin, LinesCodec>,
    reader_task: JoinHandle<()>,
}

pub struct BridgeDriver {
    user_id: Uuid,
    session_dir: PathBuf,
    config: BridgeConfig,
    process: Mutex<Option<BridgeProcess>>,
    pending: Pending,
    next_id: AtomicU64,
    shutting_down: Arc<AtomicBool>,
}

impl BridgeDriver {
    pub fn new(user_id: Uuid, session_dir: &Path, config: BridgeConfig) -> Self {
        Self {
            user_id,
            session_dir: session_dir.to_path_buf(),
            config,
            process: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    fn command(&self) -> Result<Command, DriverError> {
        let browser_args = serde_json::to_string(&self.config.browser_args)?;
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .env("WAGATE_CLIENT_ID", self.user_id.to_string())
            .env("WAGATE_SESSION_DIR", &self.session_dir)
            .env("WAGATE_HEADLESS", self.config.headless.to_string())
            .env("WAGATE_BROWSER_ARGS", browser_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, DriverError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = serde_json::to_string(&BridgeRequest { id, method, params })?;
        {
            let mut process = self.process.lock().await;
            let Some(process) = process.as_mut() else {
                self.pending.lock().await.remove(&id);
                return Err(DriverError::Closed);
            };
            if let Err(e) = process.writer.send(line).await {
                self.pending.lock().await.remove(&id);
                return Err(DriverError::Transport(format!("write to bridge failed: {}", e)));
            }
        }

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(DriverError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(DriverError::Timeout(timeout));
            }
        };

        if reply.ok {
            Ok(reply.result)
        } else {
            Err(DriverError::Transport(
                reply.error.unwrap_or_else(|| format!("bridge rejected `{}`", method)),
            ))
        }
    }
}

#[async_trait]
impl AutomationDriver for BridgeDriver {
    async fn launch(&self, events: mpsc::UnboundedSender<DriverEvent>) -> Result<(), DriverError> {
        let mut child = self.command()?.spawn().map_err(|e| {
            DriverError::Launch(format!("cannot spawn `{}`: {}", self.config.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::Launch("failed to open bridge stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Launch("failed to open bridge stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DriverError::Launch("failed to open bridge stderr".to_string()))?;

        let user_id = self.user_id;
        let pending = Arc::clone(&self.pending);
        let shutting_down = Arc::clone(&self.shutting_down);

        // ── Reader: events + replies from stdout ──────────────────────────
        let reader_task = tokio::spawn(async move {
            let mut lines =
                FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "Bridge read error");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let message: BridgeMessage = match serde_json::from_str(&line) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "Unparseable bridge message");
                        continue;
                    }
                };
                match Inbound::from(message) {
                    Inbound::Event(event) => {
                        if events.send(event).is_err() {
                            tracing::debug!(user_id = %user_id, "Event receiver gone");
                        }
                    }
                    Inbound::Reply(id, reply) => match pending.lock().await.remove(&id) {
                        Some(tx) => {
                            let _ = tx.send(reply);
                        }
                        None => {
                            tracing::debug!(user_id = %user_id, id, "Reply for unknown request")
                        }
                    },
                }
            }

            // Fail in-flight requests
            pending.lock().await.clear();
            if !shutting_down.load(Ordering::SeqCst) {
                tracing::warn!(user_id = %user_id, "Bridge process exited unexpectedly");
                let _ = events.send(DriverEvent::Disconnected("bridge process exited".to_string()));
            }
        });

        // ── Stderr drain ──────────────────────────────────────────────────
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
            while let Some(Ok(line)) = lines.next().await {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    tracing::debug!(user_id = %user_id, "[bridge:stderr] {}", trimmed);
                }
            }
        });

        *self.process.lock().await = Some(BridgeProcess {
            child,
            writer: FramedWrite::new(stdin, LinesCodec::new()),
            reader_task,
        });
        tracing::info!(
            user_id = %self.user_id,
            command = %self.config.command,
            session_dir = %self.session_dir.display(),
            "Bridge process spawned"
        );

        let launch_timeout = Duration::from_secs(self.config.launch_timeout_seconds);
        self.request("initialize", serde_json::json!({}), launch_timeout)
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;
        Ok(())
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, DriverError> {
        let timeout = Duration::from_secs(self.config.request_timeout_seconds);
        let result = self
            .request(
                "send_message",
                serde_json::json!({ "chatId": chat_id, "content": text }),
                timeout,
            )
            .await?;

        result["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DriverError::Transport("bridge reply missing message id".to_string()))
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.process.lock().await.is_none() {
            return Ok(());
        }

        if let Err(e) = self
            .request("destroy", serde_json::json!({}), DESTROY_TIMEOUT)
            .await
        {
            tracing::debug!(user_id = %self.user_id, error = %e, "Bridge destroy request failed");
        }

        if let Some(mut process) = self.process.lock().await.take() {
            if let Err(e) = process.child.kill().await {
                tracing::debug!(user_id = %self.user_id, error = %e, "Bridge kill failed");
            }
            process.reader_task.abort();
        }
        tracing::info!(user_id = %self.user_id, "Bridge process stopped");
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
