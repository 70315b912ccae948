pub mod api_key;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod store;

pub use config::WagateConfig;
pub use error::WagateError;
pub use models::{StatusUpdate, UserRecord};
pub use store::{MemorySessionStore, PgSessionStore, SessionStore};
