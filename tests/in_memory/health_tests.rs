//! On-demand health checks and liveness notifications.

use super::helpers::{TestContext, context, quick_health_check, server_id, tool_server};
use quay::tool_server::domain::{HealthChange, HealthStatus};
use quay::tool_server::services::HealthSubscription;
use rstest::rstest;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn next_change(subscription: &mut HealthSubscription) -> HealthChange {
    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("a health change should arrive")
        .expect("the monitor should still be running")
}

async fn wait_for_status(subscription: &mut HealthSubscription, status: HealthStatus) -> HealthChange {
    loop {
        let change = next_change(subscription).await;
        if change.current().status() == status {
            return change;
        }
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn never_started_servers_are_unhealthy(context: TestContext) {
    assert!(!context.manager.is_server_healthy(&server_id("ghost")).await);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn on_demand_checks_update_the_snapshot(context: TestContext) {
    let started = context
        .manager
        .start_server(tool_server("tools"))
        .await
        .expect("start should succeed");
    assert!(context.manager.is_server_healthy(&started).await);

    context
        .runtime
        .set_responsive(&started, false)
        .expect("knob should apply");
    let healthy = context.manager.is_server_healthy(&started).await;

    assert!(!healthy);
    let status = context
        .manager
        .describe_server(&started)
        .await
        .expect("server should be described");
    assert_eq!(status.health.status(), HealthStatus::Unhealthy);
    assert!(status.health.message().is_some());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn liveness_reports_degradation_and_recovery(context: TestContext) {
    let target = server_id("watched");
    let mut subscription = context.manager.subscribe_health(Some(target.clone()));
    context
        .manager
        .start_server(tool_server("watched").with_health_check(quick_health_check(1)))
        .await
        .expect("start should succeed");

    let healthy = wait_for_status(&mut subscription, HealthStatus::Healthy).await;
    assert_eq!(healthy.server_id(), &target);

    context
        .runtime
        .set_responsive(&target, false)
        .expect("knob should apply");
    let degraded = wait_for_status(&mut subscription, HealthStatus::Unhealthy).await;
    assert_eq!(degraded.previous(), HealthStatus::Healthy);

    context
        .runtime
        .set_responsive(&target, true)
        .expect("knob should apply");
    let recovered = wait_for_status(&mut subscription, HealthStatus::Healthy).await;
    assert_eq!(recovered.previous(), HealthStatus::Unhealthy);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn long_tool_calls_do_not_fail_liveness(context: TestContext) {
    let target = server_id("busy");
    let mut subscription = context.manager.subscribe_health(Some(target.clone()));
    context
        .manager
        .start_server(tool_server("busy").with_health_check(quick_health_check(0)))
        .await
        .expect("start should succeed");
    wait_for_status(&mut subscription, HealthStatus::Healthy).await;

    let manager = Arc::clone(&context.manager);
    let busy = target.clone();
    let call = tokio::spawn(async move {
        manager
            .invoke_tool(&busy, "sleep", json!({"millis": 800}))
            .await
    });
    let degraded = tokio::time::timeout(
        Duration::from_millis(600),
        wait_for_status(&mut subscription, HealthStatus::Unhealthy),
    )
    .await;

    assert!(degraded.is_err(), "a busy server was reported unhealthy");
    let result = call
        .await
        .expect("call task should not panic")
        .expect("sleep should succeed");
    assert_eq!(result.joined_text(), "awake");
    assert!(context.manager.is_server_healthy(&target).await);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn filtered_subscriptions_ignore_other_servers(context: TestContext) {
    let mut subscription = context.manager.subscribe_health(Some(server_id("second")));
    for name in ["first", "second"] {
        context
            .manager
            .start_server(tool_server(name).with_health_check(quick_health_check(1)))
            .await
            .expect("start should succeed");
    }

    let change = next_change(&mut subscription).await;

    assert_eq!(change.server_id(), &server_id("second"));
}
