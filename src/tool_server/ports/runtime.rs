//! Container engine port for tool-server lifecycle operations.

use crate::tool_server::domain::{ContainerId, HealthCheckPolicy, VolumeBinding};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Result type for container engine operations.
pub type ContainerRuntimeResult<T> = Result<T, ContainerRuntimeError>;

/// Boxed writer connected to an exec session's stdin.
pub type ExecWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Boxed reader connected to one of an exec session's output streams.
pub type ExecReader = Pin<Box<dyn AsyncRead + Send>>;

/// Capability contract over the container engine.
///
/// Implementations must treat "not found" as success for [`stop`] and
/// [`remove`] so that teardown and orphan reaping stay idempotent.
///
/// [`stop`]: ContainerRuntime::stop
/// [`remove`]: ContainerRuntime::remove
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Makes `image` available locally, pulling it only when absent.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerRuntimeError::ImagePull`] when the pull fails.
    async fn ensure_image(&self, image: &str) -> ContainerRuntimeResult<()>;

    /// Creates a container without starting it.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerRuntimeError::Create`] when the engine rejects the
    /// container definition.
    async fn create_container(&self, spec: &ContainerSpec) -> ContainerRuntimeResult<ContainerId>;

    /// Starts a created container.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerRuntimeError::Create`] when the engine fails to
    /// start the container.
    async fn start_container(&self, container_id: &ContainerId) -> ContainerRuntimeResult<()>;

    /// Reports the container's run state, engine health, and exit code.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerRuntimeError::NotFound`] when the container does
    /// not exist.
    async fn inspect(&self, container_id: &ContainerId)
    -> ContainerRuntimeResult<ContainerInspection>;

    /// Runs `command` inside the container and returns its exit status.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerRuntimeError::Exec`] when the exec session cannot
    /// be created or its status cannot be read.
    async fn exec_probe(
        &self,
        container_id: &ContainerId,
        command: &[String],
    ) -> ContainerRuntimeResult<i64>;

    /// Spawns `command` inside the container with stdio attached.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerRuntimeError::Exec`] when the session cannot be
    /// created or attached.
    async fn exec_attach(
        &self,
        container_id: &ContainerId,
        command: &[String],
    ) -> ContainerRuntimeResult<ExecAttachment>;

    /// Returns up to `tail` recent output lines of the container.
    ///
    /// # Errors
    ///
    /// Returns engine errors; callers treat logs as best-effort.
    async fn logs(
        &self,
        container_id: &ContainerId,
        tail: usize,
    ) -> ContainerRuntimeResult<Vec<String>>;

    /// Stops the container; a missing container is success.
    ///
    /// # Errors
    ///
    /// Returns engine errors other than "not found".
    async fn stop(&self, container_id: &ContainerId) -> ContainerRuntimeResult<()>;

    /// Removes the container; a missing container is success.
    ///
    /// # Errors
    ///
    /// Returns engine errors other than "not found".
    async fn remove(&self, container_id: &ContainerId, force: bool) -> ContainerRuntimeResult<()>;

    /// Lists every container, running or not, carrying all of `labels`.
    ///
    /// # Errors
    ///
    /// Returns engine errors.
    async fn list_by_label(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> ContainerRuntimeResult<Vec<ContainerSummary>>;
}

/// Everything the engine needs to create a tool-server container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Engine container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Startup command; empty keeps the image default.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Management labels.
    pub labels: BTreeMap<String, String>,
    /// Host directory bindings.
    pub volumes: Vec<VolumeBinding>,
    /// Engine-level health check to declare, if any.
    pub health_check: Option<EngineHealthCheck>,
}

/// Health check declared to the engine's own health subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineHealthCheck {
    /// Command run by the engine inside the container.
    pub command: Vec<String>,
    /// Liveness policy driving the check.
    pub policy: HealthCheckPolicy,
}

/// Engine health reported for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineHealth {
    /// No health check is declared for the container.
    NotConfigured,
    /// The health check has not yet produced a verdict.
    Starting,
    /// The latest health check passed.
    Healthy,
    /// The health check has failed too many times.
    Unhealthy,
}

/// Point-in-time view of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerInspection {
    /// Whether the container's primary process is running.
    pub running: bool,
    /// Engine health verdict.
    pub health: EngineHealth,
    /// Exit code once the container has stopped.
    pub exit_code: Option<i64>,
}

/// Managed container discovered through a label query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container identifier.
    pub id: ContainerId,
    /// Every label on the container.
    pub labels: BTreeMap<String, String>,
}

/// Stdio handles of an attached exec session.
pub struct ExecAttachment {
    /// Tool-process stdin.
    pub stdin: ExecWriter,
    /// Tool-process stdout carrying the framed protocol stream.
    pub stdout: ExecReader,
    /// Tool-process stderr carrying diagnostics.
    pub stderr: ExecReader,
}

impl fmt::Debug for ExecAttachment {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("ExecAttachment").finish_non_exhaustive()
    }
}

/// Errors returned by container engine adapters.
#[derive(Debug, Clone, Error)]
pub enum ContainerRuntimeError {
    /// The image could not be pulled.
    #[error("failed to pull image '{image}': {reason}")]
    ImagePull {
        /// Image reference.
        image: String,
        /// Engine-provided reason.
        reason: String,
    },

    /// The container could not be created or started.
    #[error("failed to create container '{name}': {reason}")]
    Create {
        /// Container name or identifier.
        name: String,
        /// Engine-provided reason.
        reason: String,
    },

    /// The container does not exist.
    #[error("container {0} not found")]
    NotFound(ContainerId),

    /// An exec session failed.
    #[error("exec in container {container_id} failed: {reason}")]
    Exec {
        /// Target container.
        container_id: ContainerId,
        /// Engine-provided reason.
        reason: String,
    },

    /// Any other engine failure.
    #[error("container engine error during {operation}: {source}")]
    Engine {
        /// Engine operation name.
        operation: &'static str,
        /// Underlying error.
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
}

impl ContainerRuntimeError {
    /// Wraps an engine failure for `operation`.
    pub fn engine(
        operation: &'static str,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Engine {
            operation,
            source: Arc::new(err),
        }
    }

    /// Returns whether the error means the container no longer exists.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
