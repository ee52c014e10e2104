//! Spin-down and spin-up of idle subsets.

use serde_json::json;

use poolshift::environment::SubsetVersion;
use poolshift::k8s::{ResourceKind, ResourceRef};
use poolshift::pool::REPLICAS_ANNOTATION;
use poolshift::Error;

use crate::fixtures::Harness;

fn replicas(h: &Harness, name: &str) -> Option<u64> {
    h.cluster
        .object(ResourceKind::Deployment, name)
        .and_then(|d| d.get("spec.replicas").and_then(|v| v.as_u64()))
}

fn recorded(h: &Harness, name: &str) -> Option<String> {
    h.cluster
        .object(ResourceKind::Deployment, name)
        .and_then(|d| d.annotation(REPLICAS_ANNOTATION).map(String::from))
}

/// Test: Spin-down and spin-up round trip
/// Given an idle subset with one scaled and one already-empty deployment
/// When it is spun down and up again
/// Then replica counts are recorded, zeroed and restored
#[tokio::test]
async fn test_spin_down_then_up_restores_replicas() {
    let h = Harness::new();
    h.cluster.add_deployment("web-v4", "v4", 3);
    h.cluster.add_deployment("worker-v4", "v4", 0);
    h.cluster.add_deployment("web-v3", "v3", 5);
    let pools = h.pools();

    let down = pools.spin_down(SubsetVersion::new(4)).await.unwrap();
    assert_eq!(down.len(), 2);
    assert_eq!(replicas(&h, "web-v4"), Some(0));
    assert_eq!(recorded(&h, "web-v4").as_deref(), Some("3"));
    assert_eq!(recorded(&h, "worker-v4"), None);
    assert_eq!(replicas(&h, "web-v3"), Some(5));
    assert_eq!(
        h.cluster.writes(),
        vec![ResourceRef::new(ResourceKind::Deployment, "web-v4")]
    );

    pools.spin_up(SubsetVersion::new(4)).await.unwrap();
    assert_eq!(replicas(&h, "web-v4"), Some(3));
    assert_eq!(recorded(&h, "web-v4"), None);
    assert_eq!(replicas(&h, "worker-v4"), Some(0));
}

/// Test: Serving subsets are never scaled
#[tokio::test]
async fn test_spin_down_refuses_serving_subset() {
    let h = Harness::new();
    h.cluster.add_deployment("web-v2", "v2", 3);

    let err = h.pools().spin_down(SubsetVersion::new(2)).await.unwrap_err();

    assert!(matches!(err, Error::Logical(_)));
    assert!(err.to_string().contains("prod"));
    assert_eq!(replicas(&h, "web-v2"), Some(3));
    assert!(h.cluster.writes().is_empty());
}

/// Test: Corrupt annotation
/// Given a deployment whose recorded replica count is not a number
/// When spun up
/// Then the batch fails naming it and the deployment is left alone
#[tokio::test]
async fn test_spin_up_unreadable_annotation() {
    let h = Harness::new();
    h.cluster.add_deployment("web-v4", "v4", 0);
    let mut broken = h.cluster.object(ResourceKind::Deployment, "web-v4").unwrap();
    broken.set_annotation(REPLICAS_ANNOTATION, "three");
    h.cluster.insert(broken);
    h.cluster.add_deployment("worker-v4", "v4", 0);
    let mut ok = h.cluster.object(ResourceKind::Deployment, "worker-v4").unwrap();
    ok.set_annotation(REPLICAS_ANNOTATION, "2");
    h.cluster.insert(ok);

    let err = h.pools().spin_up(SubsetVersion::new(4)).await.unwrap_err();

    match err {
        Error::Aggregate { succeeded, failures } => {
            assert_eq!(succeeded, vec!["deployment/worker-v4"]);
            assert!(failures[0].to_string().contains("deployment/web-v4"));
        }
        other => panic!("expected aggregate error, got {other}"),
    }
    assert_eq!(replicas(&h, "web-v4"), Some(0));
    assert_eq!(replicas(&h, "worker-v4"), Some(2));
    assert_eq!(
        h.cluster.object(ResourceKind::Deployment, "worker-v4").unwrap().get("spec"),
        Some(&json!({"replicas": 2}))
    );
}
