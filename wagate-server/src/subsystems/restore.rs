//! Start-up session restore.
//!
//! On boot every record still flagged authenticated gets one restore attempt.
//! Attempts run one at a time so a deploy does not launch a browser per user
//! all at once. A failed attempt flips the record's flag back to false and
//! the loop moves on.

use std::sync::Arc;

use serde::Serialize;
use wagate_core::{SessionStore, StatusUpdate};

use super::manager::SessionManager;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub attempted: usize,
    pub restored: usize,
    pub failed: usize,
}

pub async fn restore_authenticated_sessions(
    manager: &Arc<SessionManager>,
    store: &dyn SessionStore,
) -> anyhow::Result<RestoreSummary> {
    let records = store.list_authenticated().await?;
    tracing::info!(
        count = records.len(),
        "Found authenticated users, restoring sessions"
    );

    let mut summary = RestoreSummary::default();
    for record in records {
        summary.attempted += 1;
        match manager.restore_session(record.id, &record.phone_number).await {
            Ok(_) => {
                summary.restored += 1;
                tracing::info!(user_id = %record.id, phone_number = %record.phone_number, "Restored session");
            }
            Err(e) => {
                summary.failed += 1;
                tracing::warn!(
                    user_id = %record.id,
                    phone_number = %record.phone_number,
                    error = %e,
                    "Failed to restore session"
                );
                if let Err(e) = store
                    .update_status(record.id, StatusUpdate::authenticated(false))
                    .await
                {
                    tracing::error!(user_id = %record.id, error = %e, "Failed to reset authentication flag");
                }
            }
        }
    }

    tracing::info!(
        attempted = summary.attempted,
        restored = summary.restored,
        failed = summary.failed,
        "Session restore complete"
    );
    Ok(summary)
}
