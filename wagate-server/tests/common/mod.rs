//! Shared fixtures for the wagate-server integration tests.
//!
//! `FakeDriverFactory` stands in for the stdio bridge: tests drive lifecycle
//! events by hand through `FakeDriver::emit` and inspect what was sent.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;
use wagate_core::MemorySessionStore;
use wagate_server::subsystems::{
    AutomationDriver, DriverError, DriverEvent, DriverFactory, LifecycleEvent, SessionManager,
    SessionSettings,
};

pub struct FakeDriver {
    pub user_id: Uuid,
    pub session_dir: PathBuf,
    events: Mutex<Option<mpsc::UnboundedSender<DriverEvent>>>,
    on_launch: Vec<DriverEvent>,
    fail_launch: bool,
    shutdown_delay: Duration,
    pub sent: Mutex<Vec<(String, String)>>,
    pub shutdowns: AtomicUsize,
}

impl FakeDriver {
    /// Push a lifecycle event as if the automation library fired it. Events
    /// sent after the adapter was destroyed are silently lost.
    pub fn emit(&self, event: DriverEvent) {
        let guard = self.events.lock().unwrap();
        let tx = guard.as_ref().expect("driver was never launched");
        let _ = tx.send(event);
    }

    pub fn launched(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Wait until `shutdown` has completed `count` times.
    pub async fn wait_for_shutdowns(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.shutdown_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for driver shutdown");
    }
}

#[async_trait]
impl AutomationDriver for FakeDriver {
    async fn launch(&self, events: mpsc::UnboundedSender<DriverEvent>) -> Result<(), DriverError> {
        if self.fail_launch {
            return Err(DriverError::Launch("browser failed to start".to_string()));
        }
        for event in &self.on_launch {
            let _ = events.send(event.clone());
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, DriverError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((chat_id.to_string(), text.to_string()));
        Ok(format!("true_{}_MSG{}", chat_id, sent.len()))
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        if !self.shutdown_delay.is_zero() {
            tokio::time::sleep(self.shutdown_delay).await;
        }
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Keeps every driver it hands out, latest last per user.
#[derive(Default)]
pub struct FakeDriverFactory {
    drivers: Mutex<HashMap<Uuid, Vec<Arc<FakeDriver>>>>,
    on_launch: Mutex<Vec<DriverEvent>>,
    fail_launch: Mutex<bool>,
    shutdown_delay: Mutex<Duration>,
}

impl FakeDriverFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Events every subsequently created driver fires right after launch.
    pub fn script_launch(&self, events: Vec<DriverEvent>) {
        *self.on_launch.lock().unwrap() = events;
    }

    pub fn fail_launches(&self, fail: bool) {
        *self.fail_launch.lock().unwrap() = fail;
    }

    /// Make every subsequently created driver take `delay` to shut down.
    pub fn slow_shutdown(&self, delay: Duration) {
        *self.shutdown_delay.lock().unwrap() = delay;
    }

    /// Wait until the latest driver for `user_id` has been launched.
    pub async fn wait_for_launch(&self, user_id: Uuid) -> Arc<FakeDriver> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let latest = self
                    .drivers
                    .lock()
                    .unwrap()
                    .get(&user_id)
                    .and_then(|v| v.last().cloned());
                if let Some(driver) = latest.filter(|d| d.launched()) {
                    return driver;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for driver launch")
    }

    pub fn latest(&self, user_id: Uuid) -> Arc<FakeDriver> {
        self.drivers
            .lock()
            .unwrap()
            .get(&user_id)
            .and_then(|v| v.last().cloned())
            .expect("no driver created for user")
    }

    pub fn all(&self, user_id: Uuid) -> Vec<Arc<FakeDriver>> {
        self.drivers
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl DriverFactory for FakeDriverFactory {
    fn create(&self, user_id: Uuid, session_dir: &Path) -> Arc<dyn AutomationDriver> {
        let driver = Arc::new(FakeDriver {
            user_id,
            session_dir: session_dir.to_path_buf(),
            events: Mutex::new(None),
            on_launch: self.on_launch.lock().unwrap().clone(),
            fail_launch: *self.fail_launch.lock().unwrap(),
            shutdown_delay: *self.shutdown_delay.lock().unwrap(),
            sent: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
        });
        self.drivers
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .push(driver.clone());
        driver
    }

    fn name(&self) -> &str {
        "fake"
    }
}

pub struct Harness {
    pub root: tempfile::TempDir,
    pub store: Arc<MemorySessionStore>,
    pub factory: Arc<FakeDriverFactory>,
    pub sessions: Arc<SessionManager>,
}

pub fn harness(restore_timeout: Duration) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemorySessionStore::new());
    let factory = FakeDriverFactory::new();
    let sessions = SessionManager::new(
        store.clone(),
        factory.clone(),
        SessionSettings {
            root_dir: root.path().to_path_buf(),
            restore_timeout,
        },
    );
    Harness {
        root,
        store,
        factory,
        sessions,
    }
}

/// Wait for the next lifecycle event for `user_id` (already persisted when it
/// arrives).
pub async fn next_event(rx: &mut broadcast::Receiver<LifecycleEvent>, user_id: Uuid) -> LifecycleEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ev = rx.recv().await.expect("lifecycle channel closed");
            if ev.user_id == user_id {
                return ev;
            }
        }
    })
    .await
    .expect("timed out waiting for lifecycle event")
}
