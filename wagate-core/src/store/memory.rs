use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::SessionStore;
use crate::api_key;
use crate::error::Result;
use crate::models::{StatusUpdate, UserRecord};

/// In-memory store. Contents are lost on restart, so start-up restore never
/// finds anything to revive.
#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<Uuid, UserRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn find_or_create(&self, phone_number: &str) -> Result<UserRecord> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.values().find(|r| r.phone_number == phone_number) {
            return Ok(existing.clone());
        }

        let created_at = Utc::now();
        let record = UserRecord {
            id: Uuid::new_v4(),
            phone_number: phone_number.to_string(),
            api_key: api_key::generate(phone_number, created_at),
            is_authenticated: false,
            session_data: None,
            created_at,
            last_active: None,
        };
        records.insert(record.id, record.clone());
        tracing::info!(user_id = %record.id, "Created user record");
        Ok(record)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<UserRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.api_key == api_key)
            .cloned())
    }

    async fn list_authenticated(&self) -> Result<Vec<UserRecord>> {
        let mut out: Vec<UserRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.is_authenticated)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<()> {
        if let Some(record) = self.records.write().await.get_mut(&id) {
            update.apply(record, Utc::now());
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<String> {
        let count = self.records.read().await.len();
        Ok(format!("memory ({} records)", count))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
