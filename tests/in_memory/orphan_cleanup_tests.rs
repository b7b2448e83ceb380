//! Label-based reaping of containers the manager does not own.

use super::helpers::{TestContext, context, server_id, tool_server};
use quay::tool_server::domain::ManagementLabels;
use rstest::rstest;

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn cleanup_is_idempotent_and_scoped_to_the_namespace(context: TestContext) {
    let own = context.manager.labels().clone();
    let foreign = ManagementLabels::new("someone-else").expect("valid namespace");
    let first = context
        .runtime
        .seed_container("stale-one", own.for_server(&server_id("one")))
        .expect("seed should apply");
    let second = context
        .runtime
        .seed_container("stale-two", own.for_server(&server_id("two")))
        .expect("seed should apply");
    let theirs = context
        .runtime
        .seed_container("theirs", foreign.for_server(&server_id("one")))
        .expect("seed should apply");

    let mut removed = context
        .manager
        .cleanup_orphaned_containers()
        .await
        .expect("first cleanup should succeed");
    let again = context
        .manager
        .cleanup_orphaned_containers()
        .await
        .expect("second cleanup should succeed");

    removed.sort_by(|left, right| left.as_str().cmp(right.as_str()));
    assert_eq!(removed, vec![first, second]);
    assert!(again.is_empty());
    assert_eq!(context.runtime.container_ids(), vec![theirs]);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn cleanup_spares_owned_servers(context: TestContext) {
    let started = context
        .manager
        .start_server(tool_server("files"))
        .await
        .expect("start should succeed");

    let removed = context
        .manager
        .cleanup_orphaned_containers()
        .await
        .expect("cleanup should succeed");

    assert!(removed.is_empty());
    assert_eq!(context.runtime.containers_for(&started).len(), 1);
    assert!(context.manager.is_server_healthy(&started).await);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn restarted_manager_reaps_containers_of_a_crashed_one(context: TestContext) {
    let started = context
        .manager
        .start_server(tool_server("files"))
        .await
        .expect("start should succeed");
    let restarted = context.restarted_manager();

    let removed = restarted
        .cleanup_orphaned_containers()
        .await
        .expect("cleanup should succeed");

    assert_eq!(removed.len(), 1);
    assert!(context.runtime.containers_for(&started).is_empty());
    let relaunched = restarted
        .start_server(tool_server("files"))
        .await
        .expect("the name should be free again");
    assert_eq!(relaunched, started);
    restarted.shutdown().await;
}
