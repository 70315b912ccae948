use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One registered phone number and the mirrored state of its WhatsApp session.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub phone_number: String,
    /// Generated once at creation, never rotated.
    pub api_key: String,
    pub is_authenticated: bool,
    /// Opaque blob handed over by the automation library on `authenticated`.
    pub session_data: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: Option<DateTime<Utc>>,
}

/// Partial update of a record's session status, applied atomically.
///
/// `None` fields are left untouched; `session_data: Some(None)` clears the blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub is_authenticated: Option<bool>,
    pub session_data: Option<Option<String>>,
    pub touch: bool,
}

impl StatusUpdate {
    pub fn authenticated(flag: bool) -> Self {
        Self {
            is_authenticated: Some(flag),
            ..Self::default()
        }
    }

    /// `is_authenticated=false` and the session blob cleared.
    pub fn signed_out() -> Self {
        Self {
            is_authenticated: Some(false),
            session_data: Some(None),
            touch: false,
        }
    }

    pub fn with_session_data(mut self, data: Option<String>) -> Self {
        self.session_data = Some(data);
        self
    }

    pub fn touched(mut self) -> Self {
        self.touch = true;
        self
    }

    pub fn apply(&self, record: &mut UserRecord, now: DateTime<Utc>) {
        if let Some(flag) = self.is_authenticated {
            record.is_authenticated = flag;
        }
        if let Some(data) = &self.session_data {
            record.session_data = data.clone();
        }
        if self.touch {
            record.last_active = Some(now);
        }
    }
}
