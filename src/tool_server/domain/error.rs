//! Error types for tool-server domain validation and parsing.

use thiserror::Error;

/// Errors returned while constructing tool-server domain values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolServerDomainError {
    /// The server identifier is empty after trimming.
    #[error("server identifier must not be empty")]
    EmptyServerId,

    /// The server identifier contains characters outside `[a-z0-9_-]`.
    #[error(
        "server identifier '{0}' contains invalid characters (only lowercase alphanumeric, hyphens and underscores allowed)"
    )]
    InvalidServerId(String),

    /// The server identifier exceeds the 100-character limit.
    #[error("server identifier exceeds 100 character limit: {0}")]
    ServerIdTooLong(String),

    /// The container identifier returned by the engine is empty.
    #[error("container identifier must not be empty")]
    EmptyContainerId,

    /// The image reference is empty after trimming.
    #[error("image reference must not be empty")]
    EmptyImageReference,

    /// The in-container tool-process entrypoint has no program.
    #[error("tool-process entrypoint must not be empty")]
    EmptyEntrypoint,

    /// A volume binding source or target is empty.
    #[error("volume binding paths must not be empty")]
    EmptyVolumePath,

    /// A volume binding target is not an absolute container path.
    #[error("volume binding target '{0}' must be an absolute container path")]
    RelativeVolumeTarget(String),

    /// The label namespace is empty or contains unsupported characters.
    #[error("label namespace '{0}' must be non-empty lowercase alphanumeric, hyphens or underscores")]
    InvalidLabelNamespace(String),

    /// A health-check policy declared a zero interval.
    #[error("health-check interval must be greater than zero")]
    ZeroHealthCheckInterval,

    /// A tool descriptor name is empty after trimming.
    #[error("tool name must not be empty")]
    EmptyToolName,

    /// Transitioning between two lifecycle states is invalid.
    #[error("invalid server instance lifecycle transition: {from} -> {to}")]
    InvalidLifecycleTransition {
        /// Current lifecycle state.
        from: String,
        /// Requested target lifecycle state.
        to: String,
    },
}

/// Error returned while parsing an instance lifecycle state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown server instance state: {0}")]
pub struct ParseInstanceStateError(pub String);

/// Error returned while parsing a health status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown server health status: {0}")]
pub struct ParseHealthStatusError(pub String);

/// Error returned while parsing a volume mode.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown volume mode: {0} (expected 'ro' or 'rw')")]
pub struct ParseVolumeModeError(pub String);
