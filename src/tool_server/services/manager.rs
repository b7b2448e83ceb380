//! Registry and public API for containerized tool servers.

use super::connection::Connection;
use super::health::{HealthMonitor, HealthSubscription, LivenessTarget};
use super::instance::{InstanceError, ServerInstance};
use super::settings::ManagerSettings;
use crate::tool_server::domain::{
    ContainerId, HealthSnapshot, InstanceState, ManagementLabels, ServerConfig, ServerId,
    ToolCallResult, ToolDescriptor, ToolServerDomainError,
};
use crate::tool_server::ports::{ContainerRuntime, ContainerRuntimeError};
use crate::tool_server::protocol::{ClientError, ProtocolClient, ProtocolError, ToolExecutionError};
use crate::tool_server::transport::{ProcessTransport, TransportError};
use chrono::{DateTime, Utc};
use mockable::Clock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, watch};

/// Service-level errors for tool-server management.
#[derive(Debug, Error)]
pub enum ServerManagerError {
    /// A server with this identifier is ready or starting.
    #[error("server {0} is already running")]
    AlreadyRunning(ServerId),

    /// No server with this identifier is registered.
    #[error("server {0} not found")]
    NotFound(ServerId),

    /// The image could not be pulled.
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

    /// The container never became ready.
    #[error("server {server} did not become ready after {attempts} attempts")]
    ReadinessTimeout {
        /// Server identifier.
        server: ServerId,
        /// Attempts made.
        attempts: u32,
        /// Captured diagnostics; never empty.
        logs: Vec<String>,
    },

    /// The channel to the tool process failed.
    #[error("transport failure for server {server}: {source}")]
    Transport {
        /// Server identifier.
        server: ServerId,
        /// Channel failure.
        source: TransportError,
    },

    /// The tool process violated the protocol.
    #[error("protocol violation by server {server}: {source}")]
    Protocol {
        /// Server identifier.
        server: ServerId,
        /// Violation.
        source: ProtocolError,
    },

    /// The tool ran and reported failure.
    #[error("server {server}: {source}")]
    ToolExecution {
        /// Server identifier.
        server: ServerId,
        /// Tool failure.
        source: ToolExecutionError,
    },

    /// The start was withdrawn by a concurrent stop or shutdown.
    #[error("start of server {0} was cancelled")]
    StartCancelled(ServerId),

    /// An engine call outside the start sequence failed.
    #[error("container engine failure: {0}")]
    Runtime(#[from] ContainerRuntimeError),

    /// Validation failed.
    #[error(transparent)]
    Domain(#[from] ToolServerDomainError),
}

impl ServerManagerError {
    /// Returns whether the remote tool ran and failed.
    #[must_use]
    pub const fn is_tool_failure(&self) -> bool {
        matches!(self, Self::ToolExecution { .. })
    }

    /// Returns whether the tool could not be reached at all.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Transport { .. } | Self::StartCancelled(_)
        )
    }

    fn from_client(server: ServerId, err: ClientError) -> Self {
        match err {
            ClientError::ToolExecution(source) => Self::ToolExecution { server, source },
            ClientError::Transport(source) => Self::Transport { server, source },
            ClientError::Protocol(source) => Self::Protocol { server, source },
        }
    }

    fn from_transport(server: ServerId, source: TransportError) -> Self {
        Self::Transport { server, source }
    }
}

impl From<InstanceError> for ServerManagerError {
    fn from(err: InstanceError) -> Self {
        match err {
            InstanceError::ImagePull { server, source } => Self::ImagePull { server, source },
            InstanceError::Create { server, source } => Self::Create { server, source },
            InstanceError::ReadinessTimeout {
                server,
                attempts,
                logs,
            } => Self::ReadinessTimeout {
                server,
                attempts,
                logs,
            },
            InstanceError::Cancelled { server } => Self::StartCancelled(server),
            InstanceError::Domain(source) => Self::Domain(source),
        }
    }
}

/// Result type for manager operations.
pub type ServerManagerResult<T> = Result<T, ServerManagerError>;

/// Point-in-time description of a registered server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    /// Server identifier.
    pub server_id: ServerId,
    /// Human-readable name.
    pub display_name: String,
    /// Lifecycle state; `starting` while the start is in progress.
    pub state: InstanceState,
    /// Container handle once the server is ready.
    pub container_id: Option<ContainerId>,
    /// Last-known health.
    pub health: HealthSnapshot,
    /// When the start began.
    pub created_at: DateTime<Utc>,
    /// Recent stderr lines of the tool process; empty while starting.
    pub recent_diagnostics: Vec<String>,
}

enum RegistrySlot<R>
where
    R: ContainerRuntime,
{
    Starting {
        token: u64,
        display_name: String,
        cancel: watch::Sender<bool>,
        reserved_at: DateTime<Utc>,
    },
    Ready(Arc<Connection<R>>),
}

/// Owns every server started through it.
///
/// The registry is the only shared mutable state; it is locked briefly to
/// reserve, insert, or remove and never across engine or protocol calls.
pub struct ServerManager<R, C>
where
    R: ContainerRuntime + 'static,
    C: Clock + Send + Sync + 'static,
{
    runtime: Arc<R>,
    clock: Arc<C>,
    settings: Arc<ManagerSettings>,
    labels: ManagementLabels,
    monitor: HealthMonitor<C>,
    registry: Mutex<HashMap<ServerId, RegistrySlot<R>>>,
    next_token: AtomicU64,
}

impl<R, C> ServerManager<R, C>
where
    R: ContainerRuntime + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Creates a manager over one long-lived runtime client.
    ///
    /// # Errors
    ///
    /// Returns [`ServerManagerError::Domain`] when the settings are invalid.
    pub fn new(runtime: Arc<R>, clock: Arc<C>, settings: ManagerSettings) -> ServerManagerResult<Self> {
        settings.validate()?;
        let labels = settings.labels()?;
        let monitor = HealthMonitor::new(
            Arc::clone(&clock),
            settings.ping_timeout(),
            settings.health_event_capacity,
        );
        Ok(Self {
            runtime,
            clock,
            settings: Arc::new(settings),
            labels,
            monitor,
            registry: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Returns the label set this manager stamps and reaps by.
    #[must_use]
    pub const fn labels(&self) -> &ManagementLabels {
        &self.labels
    }

    /// Returns the active settings.
    #[must_use]
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Starts a server and returns its identifier once it is ready.
    ///
    /// # Errors
    ///
    /// Returns [`ServerManagerError::AlreadyRunning`] for a duplicate
    /// identifier, [`ServerManagerError::StartCancelled`] when a concurrent
    /// stop withdrew the reservation, and image, create, readiness, transport,
    /// or protocol errors from the start sequence. Whatever was created is
    /// torn down before an error is returned.
    pub async fn start_server(&self, config: ServerConfig) -> ServerManagerResult<ServerId> {
        let server_id = config.id().clone();
        let policy = match config.health_check() {
            Some(policy) => *policy,
            None => self.settings.default_health_check()?,
        };
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (cancel, mut cancel_rx) = watch::channel(false);
        {
            let mut registry = self.registry.lock().await;
            if registry.contains_key(&server_id) {
                return Err(ServerManagerError::AlreadyRunning(server_id));
            }
            registry.insert(
                server_id.clone(),
                RegistrySlot::Starting {
                    token,
                    display_name: config.display_name().to_owned(),
                    cancel,
                    reserved_at: self.clock.utc(),
                },
            );
        }
        tracing::info!(server = %server_id, image = %config.image(), "starting server");

        let outcome = self.launch(Arc::new(config), &mut cancel_rx).await;

        let mut registry = self.registry.lock().await;
        let still_reserved = matches!(
            registry.get(&server_id),
            Some(RegistrySlot::Starting { token: current, .. }) if *current == token
        );

        match outcome {
            Ok(connection) if still_reserved => {
                let ready = Arc::new(connection);
                let target = LivenessTarget {
                    client: ready.client(),
                    runtime: Arc::clone(&self.runtime) as Arc<dyn ContainerRuntime>,
                    container_id: ready.container_id().clone(),
                    exec_command: self.settings.probe_command.clone(),
                    exec_timeout: self.settings.probe_timeout(),
                };
                self.monitor
                    .watch(server_id.clone(), target, ready.health_handle(), policy);
                registry.insert(server_id.clone(), RegistrySlot::Ready(Arc::clone(&ready)));
                drop(registry);
                tracing::info!(server = %server_id, container = %ready.container_id().short(), "server registered");
                Ok(server_id)
            }
            Ok(connection) => {
                drop(registry);
                tracing::info!(server = %server_id, "start withdrawn; tearing down");
                connection
                    .teardown(&self.monitor, self.settings.close_timeout())
                    .await;
                Err(ServerManagerError::StartCancelled(server_id))
            }
            Err(err) => {
                if still_reserved {
                    registry.remove(&server_id);
                }
                drop(registry);
                tracing::warn!(server = %server_id, error = %err, "server failed to start");
                Err(err)
            }
        }
    }

    /// Stops a server. Unknown identifiers are a no-op.
    ///
    /// The registry entry is removed before teardown begins; a pending start
    /// is cancelled and unwinds on its own.
    pub async fn stop_server(&self, server_id: &ServerId) {
        let slot = self.registry.lock().await.remove(server_id);
        match slot {
            None => tracing::debug!(server = %server_id, "stop requested for unknown server"),
            Some(RegistrySlot::Starting { cancel, .. }) => {
                tracing::info!(server = %server_id, "cancelling pending start");
                drop(cancel.send(true));
            }
            Some(RegistrySlot::Ready(connection)) => {
                tracing::info!(server = %server_id, "stopping server");
                connection
                    .teardown(&self.monitor, self.settings.close_timeout())
                    .await;
            }
        }
    }

    /// Returns the identifiers of ready servers, sorted.
    pub async fn list_servers(&self) -> Vec<ServerId> {
        let registry = self.registry.lock().await;
        let mut server_ids: Vec<ServerId> = registry
            .iter()
            .filter(|(_, slot)| matches!(slot, RegistrySlot::Ready(_)))
            .map(|(server_id, _)| server_id.clone())
            .collect();
        server_ids.sort();
        server_ids
    }

    /// Describes a ready or starting server.
    ///
    /// # Errors
    ///
    /// Returns [`ServerManagerError::NotFound`] when the server is unknown.
    pub async fn describe_server(&self, server_id: &ServerId) -> ServerManagerResult<ServerStatus> {
        let connection = {
            let registry = self.registry.lock().await;
            match registry.get(server_id) {
                None => return Err(ServerManagerError::NotFound(server_id.clone())),
                Some(RegistrySlot::Starting {
                    display_name,
                    reserved_at,
                    ..
                }) => {
                    return Ok(ServerStatus {
                        server_id: server_id.clone(),
                        display_name: display_name.clone(),
                        state: InstanceState::Starting,
                        container_id: None,
                        health: HealthSnapshot::unknown(*reserved_at),
                        created_at: *reserved_at,
                        recent_diagnostics: Vec::new(),
                    });
                }
                Some(RegistrySlot::Ready(connection)) => Arc::clone(connection),
            }
        };
        Ok(ServerStatus {
            server_id: server_id.clone(),
            display_name: connection.display_name().to_owned(),
            state: connection.state().await,
            container_id: Some(connection.container_id().clone()),
            health: connection.health(),
            created_at: connection.created_at(),
            recent_diagnostics: connection.recent_diagnostics(),
        })
    }

    /// Lists the tools of a ready server.
    ///
    /// # Errors
    ///
    /// Returns [`ServerManagerError::NotFound`] for unknown servers, a
    /// transport error on timeout, and client errors otherwise.
    pub async fn list_server_tools(
        &self,
        server_id: &ServerId,
    ) -> ServerManagerResult<Vec<ToolDescriptor>> {
        let client = self.ready_client(server_id).await?;
        self.bounded_call(server_id, client.list_tools()).await
    }

    /// Invokes a tool on a ready server.
    ///
    /// # Errors
    ///
    /// Returns [`ServerManagerError::NotFound`] for unknown servers,
    /// [`ServerManagerError::ToolExecution`] when the tool fails, and a
    /// transport error when the channel breaks or the call times out.
    pub async fn invoke_tool(
        &self,
        server_id: &ServerId,
        tool_name: &str,
        arguments: Value,
    ) -> ServerManagerResult<ToolCallResult> {
        let client = self.ready_client(server_id).await?;
        tracing::debug!(server = %server_id, tool = tool_name, "invoking tool");
        self.bounded_call(server_id, client.call_tool(tool_name, arguments))
            .await
    }

    /// Pings a server; unknown servers, failures, and timeouts are unhealthy.
    ///
    /// The outcome is recorded as the server's health snapshot.
    pub async fn is_server_healthy(&self, server_id: &ServerId) -> bool {
        let Some(connection) = self.ready_connection(server_id).await else {
            return false;
        };
        let client = connection.client();
        let ping = tokio::time::timeout(self.settings.ping_timeout(), client.ping()).await;
        let snapshot = match ping {
            Ok(Ok(())) => HealthSnapshot::healthy(self.monitor.now()),
            Ok(Err(err)) => HealthSnapshot::unhealthy(self.monitor.now(), err.to_string()),
            Err(_) => HealthSnapshot::unhealthy(self.monitor.now(), "liveness ping timed out"),
        };
        let healthy = snapshot.is_healthy();
        self.monitor
            .record(server_id, &connection.health_handle(), snapshot);
        healthy
    }

    /// Force-removes managed containers this manager does not own.
    ///
    /// Containers of ready servers (by container id) and of pending starts
    /// (by server label) are spared. Already-vanished containers are
    /// tolerated, so repeated calls are safe.
    ///
    /// # Errors
    ///
    /// Returns [`ServerManagerError::Runtime`] when the engine cannot list
    /// containers.
    pub async fn cleanup_orphaned_containers(&self) -> ServerManagerResult<Vec<ContainerId>> {
        let candidates = self.runtime.list_by_label(&self.labels.selector()).await?;

        let (owned_containers, pending_servers) = {
            let registry = self.registry.lock().await;
            let mut owned = HashSet::new();
            let mut pending = HashSet::new();
            for (server_id, slot) in registry.iter() {
                match slot {
                    RegistrySlot::Ready(connection) => {
                        owned.insert(connection.container_id().clone());
                    }
                    RegistrySlot::Starting { .. } => {
                        pending.insert(server_id.clone());
                    }
                }
            }
            (owned, pending)
        };

        let mut removed = Vec::new();
        for candidate in candidates {
            if owned_containers.contains(&candidate.id) {
                continue;
            }
            let server = ManagementLabels::server_of(&candidate.labels);
            if server
                .as_ref()
                .is_some_and(|server_id| pending_servers.contains(server_id))
            {
                continue;
            }

            let server_label = server.as_ref().map_or("unknown", ServerId::as_str);
            tracing::info!(server = server_label, container = %candidate.id.short(), "reaping orphaned container");
            if let Err(err) = self.runtime.stop(&candidate.id).await {
                tracing::warn!(container = %candidate.id.short(), error = %err, "failed to stop orphaned container");
            }
            match self.runtime.remove(&candidate.id, true).await {
                Ok(()) => removed.push(candidate.id),
                Err(err) => {
                    tracing::warn!(container = %candidate.id.short(), error = %err, "failed to remove orphaned container");
                }
            }
        }
        Ok(removed)
    }

    /// Subscribes to health changes, optionally for one server only.
    #[must_use]
    pub fn subscribe_health(&self, filter: Option<ServerId>) -> HealthSubscription {
        self.monitor.subscribe(filter)
    }

    /// Cancels pending starts and tears down every ready server.
    pub async fn shutdown(&self) {
        let slots: Vec<(ServerId, RegistrySlot<R>)> =
            self.registry.lock().await.drain().collect();
        tracing::info!(servers = slots.len(), "shutting down server manager");

        let mut teardowns = Vec::new();
        for (server_id, slot) in slots {
            match slot {
                RegistrySlot::Starting { cancel, .. } => {
                    tracing::debug!(server = %server_id, "cancelling pending start");
                    drop(cancel.send(true));
                }
                RegistrySlot::Ready(connection) => teardowns.push(connection),
            }
        }

        let close_timeout = self.settings.close_timeout();
        futures::future::join_all(
            teardowns
                .iter()
                .map(|connection| connection.teardown(&self.monitor, close_timeout)),
        )
        .await;
        self.monitor.unwatch_all().await;
    }

    async fn launch(
        &self,
        config: Arc<ServerConfig>,
        cancel: &mut watch::Receiver<bool>,
    ) -> ServerManagerResult<Connection<R>> {
        let server_id = config.id().clone();
        let mut instance = ServerInstance::new(
            Arc::clone(&config),
            Arc::clone(&self.runtime),
            Arc::clone(&self.settings),
            self.labels.clone(),
            &*self.clock,
        );

        let container_id = match instance.start().await {
            Ok(container_id) => container_id,
            Err(err) => {
                instance.stop().await;
                return Err(err.into());
            }
        };
        if let Err(err) = instance.wait_ready(cancel).await {
            instance.stop().await;
            return Err(err.into());
        }

        let attached = ProcessTransport::attach(
            &*self.runtime,
            &container_id,
            config.entrypoint(),
            server_id.clone(),
            self.settings.transport_limits(),
        )
        .await;
        let transport = match attached {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                instance.stop().await;
                return Err(ServerManagerError::from_transport(server_id, err));
            }
        };

        let client = Arc::new(ProtocolClient::new(server_id.clone(), Arc::clone(&transport)));
        let handshake = tokio::time::timeout(self.settings.handshake_timeout(), client.initialize())
            .await
            .map_err(|_| {
                ServerManagerError::from_transport(
                    server_id.clone(),
                    TransportError::Timeout(self.settings.handshake_timeout()),
                )
            })
            .and_then(|result| result.map_err(|err| ServerManagerError::from_client(server_id.clone(), err)));

        if let Err(err) = handshake {
            let diagnostics = transport.recent_diagnostics();
            tracing::warn!(server = %server_id, error = %err, stderr = ?diagnostics, "handshake failed");
            client.close(self.settings.close_timeout()).await;
            transport.close().await;
            instance.stop().await;
            return Err(err);
        }

        Ok(Connection::new(instance, container_id, transport, client))
    }

    async fn ready_connection(&self, server_id: &ServerId) -> Option<Arc<Connection<R>>> {
        match self.registry.lock().await.get(server_id) {
            Some(RegistrySlot::Ready(connection)) => Some(Arc::clone(connection)),
            Some(RegistrySlot::Starting { .. }) | None => None,
        }
    }

    async fn ready_client(&self, server_id: &ServerId) -> ServerManagerResult<Arc<ProtocolClient>> {
        self.ready_connection(server_id)
            .await
            .map(|connection| connection.client())
            .ok_or_else(|| ServerManagerError::NotFound(server_id.clone()))
    }

    async fn bounded_call<T>(
        &self,
        server_id: &ServerId,
        call: impl Future<Output = Result<T, ClientError>>,
    ) -> ServerManagerResult<T> {
        let timeout = self.settings.call_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => {
                result.map_err(|err| ServerManagerError::from_client(server_id.clone(), err))
            }
            Err(_) => Err(ServerManagerError::from_transport(
                server_id.clone(),
                TransportError::Timeout(timeout),
            )),
        }
    }
}
