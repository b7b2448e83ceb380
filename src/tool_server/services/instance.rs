//! Lifecycle of one tool-server container.

use super::ManagerSettings;
use crate::tool_server::domain::{
    ContainerId, HealthSnapshot, InstanceState, ManagementLabels, ServerConfig, ServerId,
    ToolServerDomainError,
};
use crate::tool_server::ports::{
    ContainerRuntime, ContainerRuntimeError, ContainerSpec, EngineHealth, EngineHealthCheck,
};
use chrono::{DateTime, Utc};
use mockable::Clock;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::watch;

/// Health snapshot shared between an instance and its monitor.
pub type SharedHealth = Arc<RwLock<HealthSnapshot>>;

/// Errors raised while driving an instance through its lifecycle.
#[derive(Debug, Clone, Error)]
pub enum InstanceError {
    /// The image could not be made available.
    #[error("failed to pull image for server {server}: {source}")]
    ImagePull {
        /// Server identifier.
        server: ServerId,
        /// Engine failure.
        source: ContainerRuntimeError,
    },

    /// The container could not be created or started.
    #[error("failed to create container for server {server}: {source}")]
    Create {
        /// Server identifier.
        server: ServerId,
        /// Engine failure.
        source: ContainerRuntimeError,
    },

    /// The readiness budget ran out, or the container vanished.
    #[error("server {server} did not become ready after {attempts} attempts")]
    ReadinessTimeout {
        /// Server identifier.
        server: ServerId,
        /// Attempts made.
        attempts: u32,
        /// Container log tail followed by per-attempt observations.
        logs: Vec<String>,
    },

    /// Readiness probing was cancelled.
    #[error("readiness probing for server {server} was cancelled")]
    Cancelled {
        /// Server identifier.
        server: ServerId,
    },

    /// A lifecycle rule was violated.
    #[error(transparent)]
    Domain(#[from] ToolServerDomainError),
}

enum ProbeOutcome {
    Pending(String),
    Vanished,
}

/// State machine around one container.
pub struct ServerInstance<R>
where
    R: ContainerRuntime,
{
    config: Arc<ServerConfig>,
    runtime: Arc<R>,
    settings: Arc<ManagerSettings>,
    labels: ManagementLabels,
    state: InstanceState,
    container_id: Option<ContainerId>,
    health: SharedHealth,
    created_at: DateTime<Utc>,
}

impl<R> ServerInstance<R>
where
    R: ContainerRuntime,
{
    /// Creates an uninitialized instance.
    #[must_use]
    pub fn new(
        config: Arc<ServerConfig>,
        runtime: Arc<R>,
        settings: Arc<ManagerSettings>,
        labels: ManagementLabels,
        clock: &impl Clock,
    ) -> Self {
        let created_at = clock.utc();
        Self {
            config,
            runtime,
            settings,
            labels,
            state: InstanceState::Uninitialized,
            container_id: None,
            health: Arc::new(RwLock::new(HealthSnapshot::unknown(created_at))),
            created_at,
        }
    }

    /// Returns the server identifier.
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        self.config.id()
    }

    /// Returns the bound configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub const fn state(&self) -> InstanceState {
        self.state
    }

    /// Returns the container handle once created.
    #[must_use]
    pub const fn container_id(&self) -> Option<&ContainerId> {
        self.container_id.as_ref()
    }

    /// Returns when the instance was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the last-known health snapshot.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.health
            .read()
            .map_or_else(|poisoned| poisoned.into_inner().clone(), |guard| guard.clone())
    }

    /// Returns the shared health cell.
    #[must_use]
    pub fn health_handle(&self) -> SharedHealth {
        Arc::clone(&self.health)
    }

    /// Ensures the image, then creates and starts the container.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::ImagePull`] or [`InstanceError::Create`]; the
    /// instance is then `failed` and still needs [`stop`](Self::stop).
    pub async fn start(&mut self) -> Result<ContainerId, InstanceError> {
        self.state.transition_to(InstanceState::Created)?;
        let server = self.server_id().clone();

        if let Err(source) = self.runtime.ensure_image(self.config.image()).await {
            self.fail();
            return Err(InstanceError::ImagePull { server, source });
        }

        let spec = self.container_spec();
        let container_id = match self.runtime.create_container(&spec).await {
            Ok(container_id) => container_id,
            Err(source) => {
                self.fail();
                return Err(InstanceError::Create { server, source });
            }
        };
        self.container_id = Some(container_id.clone());
        self.transition(InstanceState::Created)?;

        if let Err(source) = self.runtime.start_container(&container_id).await {
            self.fail();
            return Err(InstanceError::Create { server, source });
        }
        self.transition(InstanceState::Starting)?;
        Ok(container_id)
    }

    /// Polls until the container can serve exec sessions.
    ///
    /// The loop aborts between attempts once `cancel` reads `true` or its
    /// sender is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::ReadinessTimeout`] when the budget runs out or
    /// the container vanishes, and [`InstanceError::Cancelled`] on
    /// cancellation.
    pub async fn wait_ready(&mut self, cancel: &mut watch::Receiver<bool>) -> Result<(), InstanceError> {
        self.transition(InstanceState::ReadinessProbing)?;
        let server = self.server_id().clone();
        let Some(container_id) = self.container_id.clone() else {
            self.fail();
            return Err(InstanceError::ReadinessTimeout {
                server,
                attempts: 0,
                logs: vec!["no container was created".to_owned()],
            });
        };

        let attempts = self.settings.readiness_attempts.max(1);
        let backoff = self.settings.readiness_backoff();
        let mut observations = Vec::new();

        for attempt in 1..=attempts {
            if *cancel.borrow() {
                self.fail();
                return Err(InstanceError::Cancelled { server });
            }

            match self.probe_once(&container_id).await {
                Ok(()) => {
                    self.transition(InstanceState::Ready)?;
                    tracing::info!(server = %server, container = %container_id.short(), attempt, "server ready");
                    return Ok(());
                }
                Err(ProbeOutcome::Vanished) => {
                    self.fail();
                    observations.push(format!(
                        "attempt {attempt}: container {} disappeared",
                        container_id.short()
                    ));
                    return Err(InstanceError::ReadinessTimeout {
                        server,
                        attempts: attempt,
                        logs: observations,
                    });
                }
                Err(ProbeOutcome::Pending(observation)) => {
                    tracing::debug!(server = %server, attempt, observation = %observation, "not ready yet");
                    observations.push(format!("attempt {attempt}: {observation}"));
                }
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            self.fail();
                            return Err(InstanceError::Cancelled { server });
                        }
                    }
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }

        let mut logs = self.log_tail(&container_id).await;
        logs.extend(observations);
        self.fail();
        Err(InstanceError::ReadinessTimeout {
            server,
            attempts,
            logs,
        })
    }

    /// Stops and removes the container. Step failures are logged only.
    pub async fn stop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if self.state.can_transition_to(InstanceState::Stopping) {
            self.state = InstanceState::Stopping;
        }

        if let Some(container_id) = self.container_id.clone() {
            let server = self.server_id().clone();
            if let Err(err) = self.runtime.stop(&container_id).await {
                tracing::warn!(server = %server, container = %container_id.short(), error = %err, "failed to stop container");
            }
            if let Err(err) = self.runtime.remove(&container_id, true).await {
                tracing::warn!(server = %server, container = %container_id.short(), error = %err, "failed to remove container");
            }
        }

        if self.state.can_transition_to(InstanceState::Terminated) {
            self.state = InstanceState::Terminated;
            tracing::info!(server = %self.server_id(), "server terminated");
        }
    }

    fn container_spec(&self) -> ContainerSpec {
        let server_id = self.config.id();
        ContainerSpec {
            name: self.labels.container_name(server_id),
            image: self.config.image().to_owned(),
            command: self.config.command().to_vec(),
            env: self.config.env().clone(),
            labels: self.labels.for_server(server_id),
            volumes: self.config.volumes().to_vec(),
            health_check: self.config.health_check().map(|policy| EngineHealthCheck {
                command: self.settings.probe_command.clone(),
                policy: *policy,
            }),
        }
    }

    async fn probe_once(&self, container_id: &ContainerId) -> Result<(), ProbeOutcome> {
        let inspection = match self.runtime.inspect(container_id).await {
            Ok(inspection) => inspection,
            Err(err) if err.is_not_found() => return Err(ProbeOutcome::Vanished),
            Err(err) => return Err(ProbeOutcome::Pending(format!("inspect failed: {err}"))),
        };

        if !inspection.running {
            let exit = inspection
                .exit_code
                .map_or_else(|| "none".to_owned(), |code| code.to_string());
            return Err(ProbeOutcome::Pending(format!(
                "container not running (exit code {exit})"
            )));
        }

        if self.config.health_check().is_some() && inspection.health != EngineHealth::Healthy {
            return Err(ProbeOutcome::Pending(format!(
                "engine health is {:?}",
                inspection.health
            )));
        }

        let probe = self
            .runtime
            .exec_probe(container_id, &self.settings.probe_command);
        match tokio::time::timeout(self.settings.probe_timeout(), probe).await {
            Err(_) => Err(ProbeOutcome::Pending(format!(
                "exec probe timed out after {:?}",
                self.settings.probe_timeout()
            ))),
            Ok(Err(err)) if err.is_not_found() => Err(ProbeOutcome::Vanished),
            Ok(Err(err)) => Err(ProbeOutcome::Pending(format!("exec probe failed: {err}"))),
            Ok(Ok(0)) => Ok(()),
            Ok(Ok(status)) => Err(ProbeOutcome::Pending(format!(
                "exec probe exited with status {status}"
            ))),
        }
    }

    async fn log_tail(&self, container_id: &ContainerId) -> Vec<String> {
        match self
            .runtime
            .logs(container_id, self.settings.log_tail_lines)
            .await
        {
            Ok(lines) => lines,
            Err(err) => {
                tracing::warn!(server = %self.server_id(), container = %container_id.short(), error = %err, "failed to capture container logs");
                vec![format!("container logs unavailable: {err}")]
            }
        }
    }

    fn transition(&mut self, target: InstanceState) -> Result<(), ToolServerDomainError> {
        self.state = self.state.transition_to(target)?;
        tracing::debug!(server = %self.server_id(), state = %self.state, "instance state changed");
        Ok(())
    }

    fn fail(&mut self) {
        if self.state.can_transition_to(InstanceState::Failed) {
            self.state = InstanceState::Failed;
            tracing::info!(server = %self.server_id(), "instance failed");
        }
    }
}
