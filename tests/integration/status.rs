//! Status wait and rollout queue tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use poolshift::environment::Environment;
use poolshift::k8s::{ResourceKind, ResourceRef};
use poolshift::rollout::await_rollout;
use poolshift::status::{Completion, StatusManager};
use poolshift::Error;

use crate::fixtures::Harness;

fn rolling_deployment(ready: u64) -> Value {
    json!({
        "replicas": 2,
        "readyReplicas": ready,
        "conditions": [
            {"type": "Progressing", "status": "True"},
            {"type": "Available", "status": if ready == 2 { "True" } else { "False" }},
        ],
    })
}

fn job(condition: &str) -> Value {
    json!({"conditions": [{"type": condition, "status": "True"}]})
}

fn status_manager(h: &Harness) -> StatusManager {
    StatusManager::new(&h.ctx, h.cluster.clone())
}

const QUEUED: &str = "\
pools: {prod: v2, test: v3}
services: [web, worker]
subsets: {v2: {}, v3: {}}
rollout:
  jobs: [migrate-v3]
  services: [web-v3]
  versions: {web: 1.2.4}
";

fn remote_environment(h: &Harness) -> Environment {
    Environment::parse(
        &h.repo
            .remote_file("main", "environments/production.yaml")
            .expect("environment on remote main"),
    )
    .expect("parse environment")
}

/// Test: Deployment becomes healthy
/// Given a deployment that is ready on the third poll
/// When waited on
/// Then it completes healthy
#[tokio::test]
async fn test_deployment_becomes_healthy() {
    let h = Harness::new();
    h.cluster.script_status(
        ResourceKind::Deployment,
        "web-v3",
        vec![rolling_deployment(0), rolling_deployment(1), rolling_deployment(2)],
    );

    let completion = status_manager(&h)
        .wait_until_complete(&ResourceRef::new(ResourceKind::Deployment, "web-v3"))
        .await
        .unwrap();

    assert!(completion.is_healthy());
}

/// Test: Timeout is reported, not raised
#[tokio::test]
async fn test_wait_times_out() {
    let h = Harness::new();
    h.cluster
        .script_status(ResourceKind::Job, "migrate-v3", vec![json!({"active": 1})]);

    let completion = status_manager(&h)
        .with_timing(Duration::from_millis(5), Duration::from_millis(40))
        .wait_until_complete(&ResourceRef::new(ResourceKind::Job, "migrate-v3"))
        .await
        .unwrap();

    assert!(matches!(completion, Completion::TimedOut { elapsed } if elapsed >= Duration::from_millis(40)));
}

/// Test: One failure among many
/// Given a healthy deployment and a failed job
/// When all are waited on
/// Then one aggregate error names the failed job and the healthy deployment
#[tokio::test]
async fn test_wait_all_aggregates_failures() {
    let h = Harness::new();
    h.cluster
        .script_status(ResourceKind::Deployment, "web-v3", vec![rolling_deployment(2)]);
    h.cluster
        .script_status(ResourceKind::Job, "migrate-v3", vec![job("Failed")]);

    let err = status_manager(&h)
        .wait_until_all_complete(
            vec![
                ResourceRef::new(ResourceKind::Deployment, "web-v3"),
                ResourceRef::new(ResourceKind::Job, "migrate-v3"),
            ],
            None,
        )
        .await
        .unwrap_err();

    match err {
        Error::Aggregate { succeeded, failures } => {
            assert_eq!(succeeded, vec!["deployment/web-v3"]);
            assert_eq!(failures.len(), 1);
            assert!(failures[0].to_string().contains("job/migrate-v3"));
        }
        other => panic!("expected aggregate error, got {other}"),
    }
}

/// Test: Status read failure
/// Given a resource the cluster cannot report on
/// When waited on
/// Then the transport error propagates with the resource named
#[tokio::test]
async fn test_status_read_failure_propagates() {
    let h = Harness::new();

    let err = status_manager(&h)
        .wait_until_complete(&ResourceRef::new(ResourceKind::Deployment, "ghost"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Transport { .. }));
    assert!(err.to_string().contains("deployment/ghost"));
}

/// Test: Rollout queue drains as targets finish
/// Given a queued job and deployment that both complete healthy
/// When await_rollout runs
/// Then each is de-queued in its own commit and the request disappears
#[tokio::test]
async fn test_await_rollout_dequeues_each_target() {
    let h = Harness::new();
    h.repo
        .push_from_other("main", "environments/production.yaml", QUEUED);
    let commits = h.repo.commit_count("main");
    h.cluster.script_status(
        ResourceKind::Job,
        "migrate-v3",
        vec![json!({"active": 1}), job("Complete")],
    );
    h.cluster
        .script_status(ResourceKind::Deployment, "web-v3", vec![rolling_deployment(2)]);

    let mut done = await_rollout(Arc::clone(&h.app), &status_manager(&h))
        .await
        .unwrap();
    done.sort();

    assert_eq!(
        done,
        vec![
            ResourceRef::new(ResourceKind::Deployment, "web-v3"),
            ResourceRef::new(ResourceKind::Job, "migrate-v3"),
        ]
    );
    assert!(remote_environment(&h).rollout.is_none());
    assert_eq!(h.repo.commit_count("main"), commits + 2);
}

/// Test: Interrupted rollout keeps what is left
/// Given a queued job that fails and a deployment that succeeds
/// When await_rollout runs
/// Then it fails and only the job remains queued, the web tag gone with its deployment
#[tokio::test]
async fn test_await_rollout_keeps_failed_targets_queued() {
    let h = Harness::new();
    h.repo
        .push_from_other("main", "environments/production.yaml", QUEUED);
    h.cluster
        .script_status(ResourceKind::Job, "migrate-v3", vec![job("Failed")]);
    h.cluster
        .script_status(ResourceKind::Deployment, "web-v3", vec![rolling_deployment(2)]);

    let err = await_rollout(Arc::clone(&h.app), &status_manager(&h))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Aggregate { .. }));

    let rollout = remote_environment(&h).rollout.expect("rollout still queued");
    assert_eq!(rollout.jobs, vec!["migrate-v3"]);
    assert!(rollout.services.is_empty());
    assert!(rollout.versions.is_empty());
}

/// Test: Nothing queued
#[tokio::test]
async fn test_await_rollout_without_request() {
    let h = Harness::new();
    let head = h.repo.remote_head("main");

    let done = await_rollout(Arc::clone(&h.app), &status_manager(&h))
        .await
        .unwrap();

    assert!(done.is_empty());
    assert_eq!(h.repo.remote_head("main"), head);
    assert!(h.log_lines().iter().any(|l| l.contains("No rollout queued")));
}
