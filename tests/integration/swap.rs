//! Pool swap protocol tests.

use serde_json::Value;

use poolshift::environment::{Environment, SubsetVersion};
use poolshift::k8s::ResourceKind;
use poolshift::Error;

use crate::fixtures::Harness;

fn v(n: u32) -> SubsetVersion {
    SubsetVersion::new(n)
}

fn remote_environment(h: &Harness) -> Environment {
    let text = h
        .repo
        .remote_file("main", "environments/production.yaml")
        .expect("environment on remote main");
    Environment::parse(&text).expect("parse environment")
}

fn selector_subset(h: &Harness, service: &str) -> Option<String> {
    h.cluster
        .object(ResourceKind::Service, service)
        .and_then(|s| s.get("spec.selector.subset").and_then(Value::as_str).map(String::from))
}

fn healthy_harness() -> Harness {
    let h = Harness::new();
    h.cluster.add_fleet(&["v2", "v3"], &["web", "worker"]);
    h
}

/// Test: Successful swap
/// Given prod=v2, test=v3 and a fleet that follows its settings
/// When swap runs
/// Then the pointers are exchanged on the remote, routing follows and v2 is flagged as test
#[tokio::test]
async fn test_swap_exchanges_pools() {
    let h = healthy_harness();

    let report = h.pools().swap().await.expect("swap");

    assert_eq!(report.prod, v(3));
    assert_eq!(report.test, v(2));
    assert!(report.descending_converged);

    let env = remote_environment(&h);
    assert_eq!(env.pools.prod, v(3));
    assert_eq!(env.pools.test, v(2));

    assert_eq!(selector_subset(&h, "edge-prod").as_deref(), Some("v3"));
    assert_eq!(selector_subset(&h, "edge-test").as_deref(), Some("v2"));

    let v2 = h.subset_settings("v2").expect("v2 branch exists");
    assert_eq!(v2["testPool"], serde_yaml::Value::Bool(true));
    let v3 = h.subset_settings("v3").expect("v3 branch exists");
    assert_eq!(v3["testPool"], serde_yaml::Value::Bool(false));
    assert_eq!(h.cluster.live_flag("v2"), Value::Bool(true));
    assert_eq!(h.cluster.live_flag("v3"), Value::Bool(false));
}

/// Test: Rollback when the ascending subset never leaves the test pool
/// Given v3 pods that keep reporting testPool=true
/// When swap runs
/// Then it fails, the pointers are untouched and v3 is flagged as test again
#[tokio::test]
async fn test_swap_rolls_back_when_fleet_disagrees() {
    let h = healthy_harness();
    h.cluster.pin_flag("v3", Value::Bool(true));
    let before = h.repo.remote_head("main");

    let err = h.pools().swap().await.expect_err("swap must fail");
    assert!(matches!(err, Error::Logical(_)), "unexpected error: {err}");

    assert_eq!(h.repo.remote_head("main"), before, "environment must not change");
    let env = remote_environment(&h);
    assert_eq!(env.pools.prod, v(2));
    assert_eq!(env.pools.test, v(3));

    let v3 = h.subset_settings("v3").expect("v3 branch exists");
    assert_eq!(v3["testPool"], serde_yaml::Value::Bool(true));
    assert!(h.cluster.object(ResourceKind::Service, "edge-prod").is_none());
    assert!(h
        .log_lines()
        .iter()
        .any(|l| l.starts_with("[ERROR]") && l.contains("rolling back")));
}

/// Test: Unreachable pool
/// Given a test subset whose liveness probe fails
/// When swap runs
/// Then it fails before any branch or cluster object is written
#[tokio::test]
async fn test_swap_aborts_when_pool_unreachable() {
    let h = healthy_harness();
    h.cluster.kill_subset("v3");

    let err = h.pools().swap().await.expect_err("swap must fail");
    assert!(err.to_string().contains("not reachable"), "unexpected error: {err}");

    assert!(h.repo.remote_head("production-v3").is_none());
    assert!(h.cluster.writes().is_empty());
}

/// Test: Same subset on both pools
/// Given prod=test=v2
/// When swap runs
/// Then it is refused without probing the fleet
#[tokio::test]
async fn test_swap_refuses_identical_pools() {
    let h = healthy_harness();
    h.repo.push_from_other(
        "main",
        "environments/production.yaml",
        "pools: {prod: v2, test: v2}\nservices: [web, worker]\nsubsets: {v2: {}, v3: {}}\n",
    );

    let err = h.pools().swap().await.expect_err("swap must fail");
    assert!(matches!(err, Error::Logical(_)));
    assert_eq!(h.cluster.exec_count(), 0);
}

/// Test: Roll-forward guard
/// Given prod=v3 is newer than test=v2
/// When roll_forward runs
/// Then it is refused before any mutation
#[tokio::test]
async fn test_roll_forward_refuses_older_test() {
    let h = healthy_harness();
    h.repo.push_from_other(
        "main",
        "environments/production.yaml",
        "pools: {prod: v3, test: v2}\nservices: [web, worker]\nsubsets: {v2: {}, v3: {}}\n",
    );
    let before = h.repo.remote_head("main");

    let err = h.pools().roll_forward().await.expect_err("roll forward must fail");
    assert!(err.to_string().contains("cannot roll forward"));
    assert_eq!(h.repo.remote_head("main"), before);
    assert_eq!(h.cluster.exec_count(), 0);
}

/// Test: Roll-back guard
/// Given prod=v2 is older than test=v3
/// When roll_back runs
/// Then it is refused, and roll_forward swaps instead
#[tokio::test]
async fn test_roll_back_refuses_newer_test() {
    let h = healthy_harness();

    let err = h.pools().roll_back().await.expect_err("roll back must fail");
    assert!(err.to_string().contains("cannot roll back"));
    assert!(h.cluster.writes().is_empty());

    let report = h.pools().roll_forward().await.expect("roll forward");
    assert_eq!((report.prod, report.test), (v(3), v(2)));
}

/// Test: Descending subset does not confirm
/// Given v2 pods that keep reporting testPool=false
/// When swap runs
/// Then the swap is committed but reports the descending subset unconverged
#[tokio::test]
async fn test_swap_reports_unconverged_descending() {
    let h = healthy_harness();
    h.cluster.pin_flag("v2", Value::Bool(false));

    let report = h.pools().swap().await.expect("swap");

    assert_eq!((report.prod, report.test), (v(3), v(2)));
    assert!(!report.descending_converged);
    assert!(h
        .log_lines()
        .iter()
        .any(|l| l.starts_with("[WARN]") && l.contains("did not confirm the test pool")));
}

/// Test: Promote
/// Given a defined but idle subset v4
/// When promote(v4) runs
/// Then v4 is flagged as test and bound to the test pool
#[tokio::test]
async fn test_promote_binds_test_pool() {
    let h = Harness::new();
    h.cluster.add_fleet(&["v2", "v3", "v4"], &["web", "worker"]);
    h.repo.push_from_other(
        "main",
        "environments/production.yaml",
        "pools: {prod: v2, test: v3}\nservices: [web, worker]\nsubsets: {v2: {}, v3: {}, v4: {}}\n",
    );

    h.pools().promote(v(4)).await.expect("promote");

    let env = remote_environment(&h);
    assert_eq!(env.pools.test, v(4));
    assert_eq!(env.pools.prod, v(2));
    assert_eq!(h.cluster.live_flag("v4"), Value::Bool(true));
    assert_eq!(selector_subset(&h, "edge-test").as_deref(), Some("v4"));

    let head = h.repo.remote_head("main");
    h.pools().promote(v(4)).await.expect("promote again");
    assert_eq!(h.repo.remote_head("main"), head, "second promote is a no-op");
}

/// Test: Promote an undefined subset
#[tokio::test]
async fn test_promote_unknown_subset() {
    let h = healthy_harness();
    let err = h.pools().promote(v(9)).await.expect_err("promote must fail");
    assert!(err.to_string().contains("not defined"));
}

/// Test: Align
/// Given no subset branches yet
/// When align runs
/// Then prod is flagged off, test on, and routing is applied
#[tokio::test]
async fn test_align_sets_flags_from_pointers() {
    let h = healthy_harness();

    h.pools().align().await.expect("align");

    assert_eq!(
        h.subset_settings("v2").expect("v2 branch")["testPool"],
        serde_yaml::Value::Bool(false)
    );
    assert_eq!(
        h.subset_settings("v3").expect("v3 branch")["testPool"],
        serde_yaml::Value::Bool(true)
    );
    assert_eq!(selector_subset(&h, "edge-prod").as_deref(), Some("v2"));
    assert_eq!(selector_subset(&h, "edge-test").as_deref(), Some("v3"));
}
