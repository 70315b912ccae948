//! API key derivation.
//!
//! Keys are the hex SHA-256 of the phone number, the creation instant and a
//! random salt, so two records created for the same number in the same
//! nanosecond still get distinct keys.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Length of a generated key in hex characters.
pub const API_KEY_LEN: usize = 64;

pub fn generate(phone_number: &str, created_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(phone_number.as_bytes());
    hasher.update(created_at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    hex::encode(hasher.finalize())
}
