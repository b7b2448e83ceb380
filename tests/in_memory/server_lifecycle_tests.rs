//! Start, stop, and failure unwinding through the server manager.

use super::helpers::{
    TOOLS_IMAGE, TestContext, context, context_with, fast_settings, image_server,
    quick_health_check, server_id, tool_server,
};
use quay::tool_server::domain::InstanceState;
use quay::tool_server::services::ServerManagerError;
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn start_then_stop_leaves_nothing_behind(context: TestContext) {
    let started = context
        .manager
        .start_server(tool_server("files"))
        .await
        .expect("start should succeed");
    assert_eq!(context.manager.list_servers().await, vec![started.clone()]);
    assert_eq!(context.runtime.containers_for(&started).len(), 1);

    context.manager.stop_server(&started).await;

    assert!(context.manager.list_servers().await.is_empty());
    assert!(context.runtime.containers_for(&started).is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn started_containers_carry_management_labels(context: TestContext) {
    let started = context
        .manager
        .start_server(tool_server("files"))
        .await
        .expect("start should succeed");
    let container_id = context
        .runtime
        .containers_for(&started)
        .pop()
        .expect("one container should exist");

    let spec = context
        .runtime
        .spec_of(&container_id)
        .expect("spec should be recorded");

    assert_eq!(spec.name, "quay-itest-files");
    assert_eq!(spec.command, vec!["sleep".to_owned(), "infinity".to_owned()]);
    for (key, value) in context.manager.labels().for_server(&started) {
        assert_eq!(spec.labels.get(&key), Some(&value));
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_start_is_rejected(context: TestContext) {
    context
        .manager
        .start_server(tool_server("files"))
        .await
        .expect("first start should succeed");

    let second = context.manager.start_server(tool_server("files")).await;

    assert!(matches!(second, Err(ServerManagerError::AlreadyRunning(_))));
    assert_eq!(context.runtime.containers_for(&server_id("files")).len(), 1);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn image_pull_failure_leaves_no_orphans(context: TestContext) {
    context
        .runtime
        .fail_pulls_of("mcp/missing", "manifest unknown")
        .expect("knob should apply");

    let result = context
        .manager
        .start_server(image_server("missing", "mcp/missing"))
        .await;

    assert!(matches!(result, Err(ServerManagerError::ImagePull { .. })));
    let removed = context
        .manager
        .cleanup_orphaned_containers()
        .await
        .expect("cleanup should succeed");
    assert!(removed.is_empty());
    assert!(context.runtime.container_ids().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn readiness_timeout_reports_logs_and_cleans_up(context: TestContext) {
    context
        .runtime
        .stall_image("mcp/slow")
        .expect("knob should apply");

    let result = context
        .manager
        .start_server(image_server("slow", "mcp/slow"))
        .await;

    match result {
        Err(ServerManagerError::ReadinessTimeout { attempts, logs, .. }) => {
            assert_eq!(attempts, 3);
            assert!(!logs.is_empty());
        }
        other => panic!("expected readiness timeout, got {other:?}"),
    }
    assert!(context.runtime.container_ids().is_empty());
    assert!(context.manager.list_servers().await.is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn hung_exec_checks_time_out_each_attempt() {
    let settings = fast_settings().with_probe_timeout(Duration::from_millis(20));
    let context = context_with(settings);
    context
        .runtime
        .hang_exec_probes("mcp/hung")
        .expect("knob should apply");

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        context.manager.start_server(image_server("hung", "mcp/hung")),
    )
    .await
    .expect("start should give up within its budget");

    match result {
        Err(ServerManagerError::ReadinessTimeout { attempts, logs, .. }) => {
            assert_eq!(attempts, 3);
            assert!(
                logs.iter().any(|line| line.contains("exec probe timed out")),
                "{logs:?}"
            );
        }
        other => panic!("expected readiness timeout, got {other:?}"),
    }
    assert!(context.runtime.container_ids().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn unhealthy_engine_verdict_blocks_readiness(context: TestContext) {
    context
        .runtime
        .report_unhealthy(TOOLS_IMAGE)
        .expect("knob should apply");

    let gated = context
        .manager
        .start_server(tool_server("gated").with_health_check(quick_health_check(1)))
        .await;
    let ungated = context.manager.start_server(tool_server("ungated")).await;

    assert!(matches!(gated, Err(ServerManagerError::ReadinessTimeout { .. })));
    assert!(ungated.is_ok());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn handshake_failure_is_a_transport_error(context: TestContext) {
    context
        .runtime
        .crash_tool_process("mcp/broken")
        .expect("knob should apply");

    let result = context
        .manager
        .start_server(image_server("broken", "mcp/broken"))
        .await;

    let error = result.expect_err("start should fail");
    assert!(matches!(error, ServerManagerError::Transport { .. }), "{error:?}");
    assert!(error.is_unreachable());
    assert!(context.runtime.container_ids().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn failed_start_releases_the_identifier(context: TestContext) {
    context
        .runtime
        .stall_image("mcp/slow")
        .expect("knob should apply");
    context
        .manager
        .start_server(image_server("files", "mcp/slow"))
        .await
        .expect_err("first start should fail");

    let retried = context.manager.start_server(tool_server("files")).await;

    assert_eq!(retried.expect("retry should succeed"), server_id("files"));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn describe_reports_ready_state(context: TestContext) {
    let started = context
        .manager
        .start_server(tool_server("files"))
        .await
        .expect("start should succeed");

    let status = context
        .manager
        .describe_server(&started)
        .await
        .expect("server should be described");

    assert_eq!(status.server_id, started);
    assert_eq!(status.display_name, "files");
    assert_eq!(status.state, InstanceState::Ready);
    assert_eq!(
        status.container_id.as_ref(),
        context.runtime.containers_for(&started).first()
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn describe_includes_recent_tool_stderr(context: TestContext) {
    let started = context
        .manager
        .start_server(tool_server("chatty"))
        .await
        .expect("start should succeed");

    let mut diagnostics = Vec::new();
    for _ in 0..100 {
        diagnostics = context
            .manager
            .describe_server(&started)
            .await
            .expect("server should be described")
            .recent_diagnostics;
        if !diagnostics.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(diagnostics, vec!["fake tool server listening on stdio"]);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn unknown_servers_are_not_found_and_stop_is_a_no_op(context: TestContext) {
    let ghost = server_id("ghost");

    context.manager.stop_server(&ghost).await;
    let described = context.manager.describe_server(&ghost).await;

    assert!(matches!(described, Err(ServerManagerError::NotFound(_))));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn stop_during_start_cancels_it() {
    let settings = fast_settings().with_readiness(200, Duration::from_millis(10));
    let context = context_with(settings);
    context
        .runtime
        .stall_image("mcp/slow")
        .expect("knob should apply");
    let manager = Arc::clone(&context.manager);
    let pending =
        tokio::spawn(async move { manager.start_server(image_server("slow", "mcp/slow")).await });

    let slow = server_id("slow");
    let mut reserved = false;
    for _ in 0..100 {
        if let Ok(status) = context.manager.describe_server(&slow).await {
            assert_eq!(status.state, InstanceState::Starting);
            reserved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(reserved, "start should reserve the identifier");

    context.manager.stop_server(&slow).await;
    let outcome = pending.await.expect("start task should not panic");

    assert!(matches!(outcome, Err(ServerManagerError::StartCancelled(_))));
    assert!(context.runtime.container_ids().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_tears_down_every_server(context: TestContext) {
    for name in ["alpha", "beta"] {
        context
            .manager
            .start_server(tool_server(name))
            .await
            .expect("start should succeed");
    }

    context.manager.shutdown().await;

    assert!(context.manager.list_servers().await.is_empty());
    assert!(context.runtime.container_ids().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_starts_of_distinct_servers_succeed(context: TestContext) {
    let (first, second) = tokio::join!(
        context.manager.start_server(tool_server("alpha")),
        context.manager.start_server(tool_server("beta")),
    );

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(
        context.manager.list_servers().await,
        vec![server_id("alpha"), server_id("beta")]
    );
}
