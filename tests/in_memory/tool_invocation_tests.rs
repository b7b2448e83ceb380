//! Tool discovery and invocation against running servers.

use super::helpers::{TestContext, context, filesystem_server, server_id, tool_server, workspace_with};
use quay::tool_server::services::ServerManagerError;
use quay::tool_server::transport::TransportError;
use rstest::rstest;
use serde_json::json;

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn filesystem_server_reads_exact_file_contents(context: TestContext) {
    let contents = "first line\nsecond line with ünïcode\n";
    let (_workspace, host_dir) = workspace_with("notes.txt", contents);
    let started = context
        .manager
        .start_server(filesystem_server("files", &host_dir))
        .await
        .expect("start should succeed");

    let result = context
        .manager
        .invoke_tool(&started, "read_file", json!({"path": "/data/notes.txt"}))
        .await
        .expect("read_file should succeed");
    assert_eq!(result.joined_text(), contents);

    context.manager.stop_server(&started).await;
    assert!(context.runtime.container_ids().is_empty());
    let removed = context
        .manager
        .cleanup_orphaned_containers()
        .await
        .expect("cleanup should succeed");
    assert!(removed.is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn filesystem_server_lists_mounted_directory(context: TestContext) {
    let (_workspace, host_dir) = workspace_with("b.txt", "b");
    std::fs::write(host_dir.join("a.txt"), "a").expect("second file should be written");
    let started = context
        .manager
        .start_server(filesystem_server("files", &host_dir))
        .await
        .expect("start should succeed");

    let listing = context
        .manager
        .invoke_tool(&started, "list_directory", json!({"path": "/data"}))
        .await
        .expect("list_directory should succeed");

    assert_eq!(listing.joined_text(), "a.txt\nb.txt");
}

#[rstest]
#[case::outside_volume("/etc/passwd")]
#[case::escaping_volume("/data/../../etc/passwd")]
#[case::missing_file("/data/absent.txt")]
#[tokio::test(flavor = "multi_thread")]
async fn unreadable_paths_are_tool_failures(context: TestContext, #[case] path: &str) {
    let (_workspace, host_dir) = workspace_with("notes.txt", "secret-free");
    let started = context
        .manager
        .start_server(filesystem_server("files", &host_dir))
        .await
        .expect("start should succeed");

    let error = context
        .manager
        .invoke_tool(&started, "read_file", json!({"path": path}))
        .await
        .expect_err("read_file should fail");

    assert!(error.is_tool_failure(), "{error:?}");
    assert!(!error.is_unreachable());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn binary_files_are_refused_as_tool_failures(context: TestContext) {
    let (_workspace, host_dir) = workspace_with("notes.txt", "text");
    std::fs::write(host_dir.join("blob.bin"), b"\xff\xfe\x00binary").expect("blob should be written");
    let started = context
        .manager
        .start_server(filesystem_server("files", &host_dir))
        .await
        .expect("start should succeed");

    let error = context
        .manager
        .invoke_tool(&started, "read_file", json!({"path": "/data/blob.bin"}))
        .await
        .expect_err("read_file should fail");

    match error {
        ServerManagerError::ToolExecution { source, .. } => {
            assert!(source.message.contains("not UTF-8 text"), "{source:?}");
        }
        other => panic!("expected a tool failure, got {other:?}"),
    }
    let text = context
        .manager
        .invoke_tool(&started, "read_file", json!({"path": "/data/notes.txt"}))
        .await
        .expect("text files stay readable");
    assert_eq!(text.joined_text(), "text");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn tool_listing_follows_pagination(context: TestContext) {
    let started = context
        .manager
        .start_server(tool_server("tools"))
        .await
        .expect("start should succeed");

    let tools = context
        .manager
        .list_server_tools(&started)
        .await
        .expect("listing should succeed");

    let names: Vec<&str> = tools.iter().map(|tool| tool.name()).collect();
    assert_eq!(
        names,
        vec!["echo", "read_file", "list_directory", "sleep", "always_fails"]
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn echo_round_trips_text_past_notifications(context: TestContext) {
    let started = context
        .manager
        .start_server(tool_server("tools"))
        .await
        .expect("start should succeed");

    for text in ["one", "two"] {
        let result = context
            .manager
            .invoke_tool(&started, "echo", json!({"text": text}))
            .await
            .expect("echo should succeed");
        assert_eq!(result.joined_text(), text);
    }
}

#[rstest]
#[case::reported_failure("always_fails")]
#[case::unknown_tool("no_such_tool")]
#[tokio::test(flavor = "multi_thread")]
async fn failing_tools_are_distinguished_from_unreachable_servers(
    context: TestContext,
    #[case] tool: &str,
) {
    let started = context
        .manager
        .start_server(tool_server("tools"))
        .await
        .expect("start should succeed");

    let error = context
        .manager
        .invoke_tool(&started, tool, json!({}))
        .await
        .expect_err("tool should fail");

    assert!(matches!(error, ServerManagerError::ToolExecution { .. }), "{error:?}");
    assert!(error.is_tool_failure());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn calls_to_unknown_servers_are_not_found(context: TestContext) {
    let error = context
        .manager
        .invoke_tool(&server_id("ghost"), "echo", json!({"text": "hi"}))
        .await
        .expect_err("call should fail");

    assert!(matches!(error, ServerManagerError::NotFound(_)));
    assert!(error.is_unreachable());
    assert!(!error.is_tool_failure());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn slow_calls_time_out_and_the_channel_recovers(context: TestContext) {
    let started = context
        .manager
        .start_server(tool_server("tools"))
        .await
        .expect("start should succeed");

    let error = context
        .manager
        .invoke_tool(&started, "sleep", json!({"millis": 1_300}))
        .await
        .expect_err("call should time out");
    assert!(
        matches!(
            error,
            ServerManagerError::Transport {
                source: TransportError::Timeout(_),
                ..
            }
        ),
        "{error:?}"
    );

    let echoed = context
        .manager
        .invoke_tool(&started, "echo", json!({"text": "still here"}))
        .await
        .expect("later calls should succeed");
    assert_eq!(echoed.joined_text(), "still here");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn externally_removed_container_is_unreachable(context: TestContext) {
    let started = context
        .manager
        .start_server(tool_server("tools"))
        .await
        .expect("start should succeed");
    let container_id = context
        .runtime
        .containers_for(&started)
        .pop()
        .expect("one container should exist");

    context
        .runtime
        .remove_externally(&container_id)
        .expect("removal should apply");
    let error = context
        .manager
        .invoke_tool(&started, "echo", json!({"text": "hello"}))
        .await
        .expect_err("call should fail");

    assert!(error.is_unreachable(), "{error:?}");
    assert!(!context.manager.is_server_healthy(&started).await);
    context.manager.stop_server(&started).await;
    assert!(context.manager.list_servers().await.is_empty());
}
