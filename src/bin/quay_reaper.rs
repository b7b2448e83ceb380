//! Reaps tool-server containers left behind by a crashed manager.
//!
//! Usage:
//!
//! ```text
//! quay-reaper [settings-path]
//! ```
//!
//! The optional JSON settings file is loaded with
//! [`ManagerSettings::from_json_file`]; its `label_namespace` selects which
//! managed containers are considered. A representative file is:
//!
//! ```json
//! {
//!   "label_namespace": "ci",
//!   "stop_grace_secs": 2
//! }
//! ```
//!
//! A fresh manager owns no servers, so every container carrying the
//! namespace's management labels is stopped and removed. Run it before
//! normal operation starts. Set `RUST_LOG` to adjust log output.

use camino::Utf8PathBuf;
use mockable::DefaultClock;
use quay::telemetry::{TelemetryError, init_tracing};
use quay::tool_server::adapters::DockerContainerRuntime;
use quay::tool_server::ports::ContainerRuntimeError;
use quay::tool_server::services::{ManagerSettings, ServerManager, ServerManagerError, SettingsError};
use std::env;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Builder;

/// Boxed error type for the main result.
type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
enum ReaperError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("runtime init failed: {0}")]
    RuntimeInit(#[source] std::io::Error),
    #[error("failed to connect to the container engine: {0}")]
    Connect(#[source] ContainerRuntimeError),
    #[error(transparent)]
    Manager(#[from] ServerManagerError),
}

fn main() -> Result<(), BoxError> {
    run(env::args().skip(1)).map_err(Into::into)
}

fn run(mut args: impl Iterator<Item = String>) -> Result<(), ReaperError> {
    init_tracing("quay=info,quay_reaper=info")?;
    let settings_path = args.next().map(Utf8PathBuf::from);
    if let Some(extra) = args.next() {
        return Err(ReaperError::InvalidArgs(format!(
            "unexpected argument '{extra}'; usage: quay-reaper [settings-path]"
        )));
    }
    let settings = match settings_path {
        Some(path) => ManagerSettings::from_json_file(&path)?,
        None => ManagerSettings::default(),
    };

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(ReaperError::RuntimeInit)?;
    runtime.block_on(reap(settings))
}

async fn reap(settings: ManagerSettings) -> Result<(), ReaperError> {
    let engine =
        DockerContainerRuntime::connect_local(settings.stop_grace_secs).map_err(ReaperError::Connect)?;
    let manager = ServerManager::new(Arc::new(engine), Arc::new(DefaultClock), settings)?;
    let namespace = manager.labels().namespace().to_owned();

    let removed = manager.cleanup_orphaned_containers().await?;
    tracing::info!(namespace = %namespace, removed = removed.len(), "orphan cleanup complete");
    for container_id in &removed {
        tracing::debug!(container = %container_id, "removed orphaned container");
    }
    manager.shutdown().await;
    Ok(())
}
