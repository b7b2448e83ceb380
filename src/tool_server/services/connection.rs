//! A ready server: its instance, transport, and protocol client.

use super::health::HealthMonitor;
use super::instance::{ServerInstance, SharedHealth};
use crate::tool_server::domain::{ContainerId, HealthSnapshot, InstanceState, ServerId};
use crate::tool_server::ports::ContainerRuntime;
use crate::tool_server::protocol::ProtocolClient;
use crate::tool_server::transport::ProcessTransport;
use chrono::{DateTime, Utc};
use mockable::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Everything owned on behalf of one ready server.
///
/// Built only after the handshake succeeds and torn down as a unit.
pub struct Connection<R>
where
    R: ContainerRuntime,
{
    server_id: ServerId,
    display_name: String,
    container_id: ContainerId,
    created_at: DateTime<Utc>,
    health: SharedHealth,
    instance: Mutex<ServerInstance<R>>,
    transport: Arc<ProcessTransport>,
    client: Arc<ProtocolClient>,
}

impl<R> Connection<R>
where
    R: ContainerRuntime,
{
    /// Bundles a ready instance with its channel.
    #[must_use]
    pub fn new(
        instance: ServerInstance<R>,
        container_id: ContainerId,
        transport: Arc<ProcessTransport>,
        client: Arc<ProtocolClient>,
    ) -> Self {
        Self {
            server_id: instance.server_id().clone(),
            display_name: instance.config().display_name().to_owned(),
            container_id,
            created_at: instance.created_at(),
            health: instance.health_handle(),
            instance: Mutex::new(instance),
            transport,
            client,
        }
    }

    /// Returns the server identifier.
    #[must_use]
    pub const fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Returns the display name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns the container handle.
    #[must_use]
    pub const fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    /// Returns when the instance was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the protocol client.
    #[must_use]
    pub fn client(&self) -> Arc<ProtocolClient> {
        Arc::clone(&self.client)
    }

    /// Returns the shared health cell.
    #[must_use]
    pub fn health_handle(&self) -> SharedHealth {
        Arc::clone(&self.health)
    }

    /// Returns the last-known health snapshot.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.health
            .read()
            .map_or_else(|poisoned| poisoned.into_inner().clone(), |guard| guard.clone())
    }

    /// Returns the instance lifecycle state.
    pub async fn state(&self) -> InstanceState {
        self.instance.lock().await.state()
    }

    /// Returns recent stderr lines of the tool process.
    #[must_use]
    pub fn recent_diagnostics(&self) -> Vec<String> {
        self.transport.recent_diagnostics()
    }

    /// Cancels liveness, closes the client and transport, then stops the
    /// container. Every step tolerates earlier failures.
    pub async fn teardown<C>(&self, monitor: &HealthMonitor<C>, close_timeout: Duration)
    where
        C: Clock + Send + Sync + 'static,
    {
        monitor.unwatch(&self.server_id).await;
        self.client.close(close_timeout).await;
        self.transport.close().await;
        self.instance.lock().await.stop().await;
        tracing::info!(server = %self.server_id, container = %self.container_id.short(), "connection torn down");
    }
}
