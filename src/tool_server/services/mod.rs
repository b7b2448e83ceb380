//! Orchestration services for containerized tool servers.
//!
//! [`ServerManager`] is the public entry point. It drives each
//! [`ServerInstance`] through its lifecycle, owns the resulting
//! [`Connection`]s, and hands liveness to the [`HealthMonitor`].

mod connection;
mod health;
mod instance;
mod manager;
mod settings;

pub use connection::Connection;
pub use health::{HealthMonitor, HealthSubscription, LivenessTarget};
pub use instance::{InstanceError, ServerInstance, SharedHealth};
pub use manager::{ServerManager, ServerManagerError, ServerManagerResult, ServerStatus};
pub use settings::{ManagerSettings, SettingsError};
