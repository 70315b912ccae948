//! Session Store — persistence for user/session records.
//!
//! Provides a `SessionStore` trait with implementations for:
//! - **Postgres** — production store on the `users` table (`sql/schema.sql`)
//! - **Memory** — process-local map for development and tests

mod memory;
mod postgres;

pub use memory::MemorySessionStore;
pub use postgres::PgSessionStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{StatusUpdate, UserRecord};

/// Abstraction over the record store the session manager mirrors into.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the record for `phone_number`, creating it with a fresh API key
    /// if none exists. An existing record keeps its key.
    async fn find_or_create(&self, phone_number: &str) -> Result<UserRecord>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserRecord>>;

    /// Exact-match lookup used by the API key middleware.
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<UserRecord>>;

    /// Records flagged `is_authenticated`, oldest first.
    async fn list_authenticated(&self) -> Result<Vec<UserRecord>>;

    /// Apply a partial status update. Updating an unknown id is a no-op.
    async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<()>;

    /// Bump `last_active` to now.
    async fn touch(&self, id: Uuid) -> Result<()> {
        self.update_status(
            id,
            StatusUpdate {
                touch: true,
                ..StatusUpdate::default()
            },
        )
        .await
    }

    /// Backend description for health reporting.
    async fn health_check(&self) -> Result<String>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}
