pub mod adapter;
pub mod bridge;
pub mod driver;
pub mod manager;
pub mod qr;
pub mod registry;
pub mod restore;

pub use adapter::{ClientAdapter, ClientState};
pub use bridge::BridgeDriverFactory;
pub use driver::{AutomationDriver, DriverError, DriverEvent, DriverFactory};
pub use manager::{LifecycleEvent, LifecycleKind, SessionError, SessionManager, SessionSettings};
pub use restore::{restore_authenticated_sessions, RestoreSummary};
