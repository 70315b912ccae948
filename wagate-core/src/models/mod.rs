pub mod user;

pub use user::{StatusUpdate, UserRecord};
