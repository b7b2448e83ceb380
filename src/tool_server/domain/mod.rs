//! Domain model for containerized tool servers.
//!
//! The domain models server identity and configuration, the management label
//! contract, the instance lifecycle state machine, health snapshots, and tool
//! metadata. Engine and transport concerns remain outside this boundary.

mod config;
mod error;
mod health;
mod ids;
mod instance;
mod labels;
mod tool;

pub use config::{HealthCheckPolicy, ServerConfig, VolumeBinding, VolumeMode};
pub use error::{
    ParseHealthStatusError, ParseInstanceStateError, ParseVolumeModeError, ToolServerDomainError,
};
pub use health::{HealthChange, HealthSnapshot, HealthStatus};
pub use ids::{ContainerId, ServerId};
pub use instance::InstanceState;
pub use labels::{
    DEFAULT_NAMESPACE, MANAGED_LABEL, ManagementLabels, NAMESPACE_LABEL, SERVER_LABEL,
};
pub use tool::{ToolCallResult, ToolContent, ToolDescriptor};
