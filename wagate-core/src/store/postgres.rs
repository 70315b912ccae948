use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use super::SessionStore;
use crate::api_key;
use crate::db;
use crate::error::Result;
use crate::models::{StatusUpdate, UserRecord};

const USER_COLUMNS: &str =
    "id, phone_number, api_key, is_authenticated, session_data, created_at, last_active";

/// Postgres-backed store over the `users` table.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn find_or_create(&self, phone_number: &str) -> Result<UserRecord> {
        let created_at = Utc::now();

        // ON CONFLICT keeps the original api_key for a known phone number
        sqlx::query(
            r#"
            INSERT INTO users (id, phone_number, api_key, is_authenticated, created_at)
            VALUES ($1, $2, $3, FALSE, $4)
            ON CONFLICT (phone_number) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(phone_number)
        .bind(api_key::generate(phone_number, created_at))
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        let record: UserRecord = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE phone_number = $1",
            USER_COLUMNS
        ))
        .bind(phone_number)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserRecord>> {
        let record = sqlx::query_as(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<UserRecord>> {
        let record = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE api_key = $1",
            USER_COLUMNS
        ))
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_authenticated(&self) -> Result<Vec<UserRecord>> {
        let records = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE is_authenticated ORDER BY created_at ASC",
            USER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<()> {
        let (set_session, session_data) = match update.session_data {
            Some(data) => (true, data),
            None => (false, None),
        };

        sqlx::query(
            r#"
            UPDATE users SET
                is_authenticated = COALESCE($2, is_authenticated),
                session_data = CASE WHEN $3 THEN $4 ELSE session_data END,
                last_active = CASE WHEN $5 THEN now() ELSE last_active END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.is_authenticated)
        .bind(set_session)
        .bind(session_data)
        .bind(update.touch)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn health_check(&self) -> Result<String> {
        let version = db::health_check(&self.pool).await?;
        let users = db::check_users_table(&self.pool).await?;
        Ok(format!("{} ({} users)", version, users))
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

// ============================================================================
// TESTS — require a live PostgreSQL with sql/schema.sql applied
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_store() -> Option<PgSessionStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        db::check_users_table(&pool).await.ok()?;
        Some(PgSessionStore::new(pool))
    }

    async fn cleanup(store: &PgSessionStore, phone: &str) {
        sqlx::query("DELETE FROM users WHERE phone_number = $1")
            .bind(phone)
            .execute(store.pool())
            .await
            .ok();
    }

    #[tokio::test]
    async fn test_pg_find_or_create_keeps_api_key() {
        let store = match make_store().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_pg_find_or_create_keeps_api_key: DB unavailable");
                return;
            }
        };
        let phone = "+10000000001";
        cleanup(&store, phone).await;

        let first = store.find_or_create(phone).await.unwrap();
        let second = store.find_or_create(phone).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.api_key, second.api_key);

        let by_key = store.find_by_api_key(&first.api_key).await.unwrap();
        assert_eq!(by_key.map(|r| r.id), Some(first.id));

        cleanup(&store, phone).await;
    }

    #[tokio::test]
    async fn test_pg_update_status_partial() {
        let store = match make_store().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_pg_update_status_partial: DB unavailable");
                return;
            }
        };
        let phone = "+10000000002";
        cleanup(&store, phone).await;

        let rec = store.find_or_create(phone).await.unwrap();
        store
            .update_status(
                rec.id,
                StatusUpdate::authenticated(true)
                    .with_session_data(Some("blob".to_string()))
                    .touched(),
            )
            .await
            .unwrap();

        let after = store.find_by_id(rec.id).await.unwrap().unwrap();
        assert!(after.is_authenticated);
        assert_eq!(after.session_data.as_deref(), Some("blob"));
        assert!(after.last_active.is_some());

        // Flag-only update leaves the blob alone
        store
            .update_status(rec.id, StatusUpdate::authenticated(false))
            .await
            .unwrap();
        let after = store.find_by_id(rec.id).await.unwrap().unwrap();
        assert!(!after.is_authenticated);
        assert_eq!(after.session_data.as_deref(), Some("blob"));

        store
            .update_status(rec.id, StatusUpdate::signed_out())
            .await
            .unwrap();
        let after = store.find_by_id(rec.id).await.unwrap().unwrap();
        assert!(after.session_data.is_none());

        cleanup(&store, phone).await;
    }
}
