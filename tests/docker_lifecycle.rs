//! End-to-end lifecycle against a real Docker engine.
//!
//! These tests pull images and fetch the filesystem tool server from npm, so
//! they are ignored by default. Run them with
//! `cargo test --test docker_lifecycle -- --ignored`.

use camino::{Utf8Path, Utf8PathBuf};
use mockable::DefaultClock;
use quay::tool_server::adapters::DockerContainerRuntime;
use quay::tool_server::domain::{ServerConfig, ServerId, VolumeBinding, VolumeMode};
use quay::tool_server::services::{ManagerSettings, ServerManager};
use rstest::{fixture, rstest};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

type DockerManager = ServerManager<DockerContainerRuntime, DefaultClock>;

const NODE_IMAGE: &str = "node:22-alpine";

#[fixture]
fn manager() -> DockerManager {
    let settings = ManagerSettings::default()
        .with_label_namespace("quay-e2e")
        .with_handshake_timeout(Duration::from_secs(180))
        .with_call_timeout(Duration::from_secs(30));
    let engine = DockerContainerRuntime::connect_local(settings.stop_grace_secs)
        .expect("a local Docker engine should be reachable");
    ServerManager::new(Arc::new(engine), Arc::new(DefaultClock), settings)
        .expect("settings should be valid")
}

fn filesystem_server(host_dir: &Utf8Path) -> ServerConfig {
    let binding = VolumeBinding::new(host_dir, "/data", VolumeMode::ReadOnly)
        .expect("binding should be valid");
    ServerConfig::new(
        ServerId::new("filesystem").expect("server id should be valid"),
        "Filesystem",
        NODE_IMAGE,
        ["npx", "-y", "@modelcontextprotocol/server-filesystem", "/data"],
    )
    .expect("config should be valid")
    .with_command(["sleep", "infinity"])
    .with_volume(binding)
}

#[rstest]
#[ignore = "requires a Docker engine"]
#[tokio::test(flavor = "multi_thread")]
async fn filesystem_server_round_trip(manager: DockerManager) {
    let workspace = TempDir::new().expect("temp dir should be created");
    let host_dir = Utf8PathBuf::from_path_buf(workspace.path().to_path_buf())
        .expect("temp dir should be UTF-8");
    let contents = "quay end-to-end\n";
    std::fs::write(host_dir.join("hello.txt"), contents).expect("file should be written");

    let started = manager
        .start_server(filesystem_server(&host_dir))
        .await
        .expect("start should succeed");
    let tools = manager
        .list_server_tools(&started)
        .await
        .expect("tool listing should succeed");
    assert!(tools.iter().any(|tool| tool.name() == "read_file"));

    let result = manager
        .invoke_tool(&started, "read_file", json!({"path": "/data/hello.txt"}))
        .await
        .expect("read_file should succeed");
    assert_eq!(result.joined_text(), contents);

    manager.stop_server(&started).await;
    assert!(manager.list_servers().await.is_empty());
    let removed = manager
        .cleanup_orphaned_containers()
        .await
        .expect("cleanup should succeed");
    assert!(removed.is_empty());
}

#[rstest]
#[ignore = "requires a Docker engine"]
#[tokio::test(flavor = "multi_thread")]
async fn missing_image_fails_without_orphans(manager: DockerManager) {
    let config = ServerConfig::new(
        ServerId::new("missing").expect("server id should be valid"),
        "Missing",
        "quay.invalid/does-not-exist:never",
        ["true"],
    )
    .expect("config should be valid");

    let error = manager
        .start_server(config)
        .await
        .expect_err("start should fail");

    assert!(
        matches!(error, quay::tool_server::services::ServerManagerError::ImagePull { .. }),
        "{error:?}"
    );
    let removed = manager
        .cleanup_orphaned_containers()
        .await
        .expect("cleanup should succeed");
    assert!(removed.is_empty());
}
