//! Client Registry — process-local map of live adapters and pairing QR codes.
//!
//! The adapter and its QR code share one entry so they are always inserted,
//! replaced and removed together. Removal can be pinned to an adapter
//! generation so a superseded instance never evicts its replacement.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use super::adapter::ClientAdapter;

pub struct RegistryEntry {
    pub adapter: Arc<ClientAdapter>,
    /// Most recent pairing image (data URL).
    pub qr_code: Option<String>,
}

#[derive(Default)]
pub struct ClientRegistry {
    entries: RwLock<HashMap<Uuid, RegistryEntry>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` for its user, returning whatever entry it replaced.
    pub async fn insert(&self, adapter: Arc<ClientAdapter>) -> Option<RegistryEntry> {
        let entry = RegistryEntry {
            adapter: adapter.clone(),
            qr_code: None,
        };
        self.entries.write().await.insert(adapter.user_id(), entry)
    }

    pub async fn adapter(&self, user_id: Uuid) -> Option<Arc<ClientAdapter>> {
        self.entries
            .read()
            .await
            .get(&user_id)
            .map(|e| e.adapter.clone())
    }

    /// The registered adapter, only if it is still generation `generation`.
    pub async fn current(&self, user_id: Uuid, generation: u64) -> Option<Arc<ClientAdapter>> {
        self.adapter(user_id)
            .await
            .filter(|a| a.generation() == generation)
    }

    pub async fn qr_code(&self, user_id: Uuid) -> Option<String> {
        self.entries
            .read()
            .await
            .get(&user_id)
            .and_then(|e| e.qr_code.clone())
    }

    /// Store a QR code for the given generation. Returns false if that
    /// generation is no longer registered.
    pub async fn set_qr_code(&self, user_id: Uuid, generation: u64, qr_code: String) -> bool {
        match self.entries.write().await.get_mut(&user_id) {
            Some(entry) if entry.adapter.generation() == generation => {
                entry.qr_code = Some(qr_code);
                true
            }
            _ => false,
        }
    }

    pub async fn remove(&self, user_id: Uuid) -> Option<RegistryEntry> {
        self.entries.write().await.remove(&user_id)
    }

    /// Remove the entry only if it still holds generation `generation`.
    pub async fn remove_if_current(&self, user_id: Uuid, generation: u64) -> Option<RegistryEntry> {
        let mut entries = self.entries.write().await;
        match entries.get(&user_id) {
            Some(entry) if entry.adapter.generation() == generation => entries.remove(&user_id),
            _ => None,
        }
    }

    /// Empty the registry, handing back every adapter.
    pub async fn drain(&self) -> Vec<Arc<ClientAdapter>> {
        self.entries
            .write()
            .await
            .drain()
            .map(|(_, e)| e.adapter)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Per-identifier async critical sections. An identifier's entry lives only
/// while someone holds or waits for its lock.
#[derive(Default)]
pub struct KeyedLocks {
    locks: std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: Uuid) -> KeyedGuard<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone();
        KeyedGuard {
            owner: self,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Identifiers currently tracked.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held critical section for one identifier. Dropping it releases the lock
/// and prunes the entry when nobody else is holding or waiting.
pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self
            .owner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Waiters clone the Arc under this same map lock
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}
