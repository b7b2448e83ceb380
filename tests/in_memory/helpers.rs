//! Shared fixtures for in-memory server manager tests.

use camino::{Utf8Path, Utf8PathBuf};
use mockable::DefaultClock;
use quay::tool_server::adapters::InMemoryContainerRuntime;
use quay::tool_server::domain::{
    HealthCheckPolicy, ServerConfig, ServerId, VolumeBinding, VolumeMode,
};
use quay::tool_server::services::{ManagerSettings, ServerManager};
use rstest::fixture;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Manager over the in-memory engine.
pub type TestManager = ServerManager<InMemoryContainerRuntime, DefaultClock>;

/// Image served by the scripted tool process.
pub const TOOLS_IMAGE: &str = "mcp/fake-tools:1.0";

/// A manager together with the engine it drives.
pub struct TestContext {
    pub runtime: Arc<InMemoryContainerRuntime>,
    pub manager: Arc<TestManager>,
}

impl TestContext {
    /// Builds a second manager over the same engine, as a restarted process
    /// would.
    pub fn restarted_manager(&self) -> TestManager {
        ServerManager::new(Arc::clone(&self.runtime), Arc::new(DefaultClock), fast_settings())
            .expect("settings should be valid")
    }
}

/// Settings with short budgets so failure paths finish quickly.
pub fn fast_settings() -> ManagerSettings {
    ManagerSettings::default()
        .with_label_namespace("itest")
        .with_readiness(3, Duration::from_millis(10))
        .with_handshake_timeout(Duration::from_secs(2))
        .with_call_timeout(Duration::from_secs(1))
        .with_ping_timeout(Duration::from_millis(200))
}

/// Provides a fresh engine and manager for each test.
#[fixture]
pub fn context() -> TestContext {
    context_with(fast_settings())
}

/// Builds a context from explicit settings.
pub fn context_with(settings: ManagerSettings) -> TestContext {
    let runtime = Arc::new(InMemoryContainerRuntime::new());
    let manager = ServerManager::new(Arc::clone(&runtime), Arc::new(DefaultClock), settings)
        .expect("settings should be valid");
    TestContext {
        runtime,
        manager: Arc::new(manager),
    }
}

/// Parses a server identifier.
pub fn server_id(name: &str) -> ServerId {
    ServerId::new(name).expect("server id should be valid")
}

/// Describes a tool server running the scripted tool process.
pub fn tool_server(name: &str) -> ServerConfig {
    image_server(name, TOOLS_IMAGE)
}

/// Describes a tool server built from `image`.
pub fn image_server(name: &str, image: &str) -> ServerConfig {
    ServerConfig::new(server_id(name), name, image, ["node", "dist/index.js"])
        .expect("config should be valid")
        .with_command(["sleep", "infinity"])
}

/// Describes a filesystem server exposing `host_dir` read-only at `/data`.
pub fn filesystem_server(name: &str, host_dir: &Utf8Path) -> ServerConfig {
    tool_server(name).with_volume(
        VolumeBinding::new(host_dir, "/data", VolumeMode::ReadOnly)
            .expect("binding should be valid"),
    )
}

/// Liveness policy with a short interval.
pub fn quick_health_check(max_retries: u32) -> HealthCheckPolicy {
    HealthCheckPolicy::new(Duration::from_millis(50), max_retries).expect("policy should be valid")
}

/// Creates a temporary host directory holding one file.
pub fn workspace_with(file_name: &str, contents: &str) -> (TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp path");
    std::fs::write(path.join(file_name), contents).expect("fixture file should be written");
    (dir, path)
}
