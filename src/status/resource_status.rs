//! Kind-specific completion and health predicates.

use serde_json::Value;

use crate::k8s::{json_path, ResourceKind};

/// Snapshot of one resource's remote `status` stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceStatus {
    kind: ResourceKind,
    status: Value,
}

impl ResourceStatus {
    pub fn new(kind: ResourceKind, status: Value) -> Self {
        Self { kind, status }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn raw(&self) -> &Value {
        &self.status
    }

    /// `Some(true)` for `status: "True"`, `Some(false)` for any other status,
    /// `None` when the condition is absent.
    pub fn condition(&self, kind: &str) -> Option<bool> {
        self.status
            .get("conditions")?
            .as_array()?
            .iter()
            .find(|c| c.get("type").and_then(Value::as_str) == Some(kind))
            .map(|c| c.get("status").and_then(Value::as_str) == Some("True"))
    }

    fn condition_true(&self, kind: &str) -> bool {
        self.condition(kind).unwrap_or(false)
    }

    fn count(&self, path: &str) -> Option<u64> {
        json_path(&self.status, path).and_then(Value::as_u64)
    }

    fn phase(&self) -> Option<&str> {
        self.status.get("phase").and_then(Value::as_str)
    }

    pub fn is_complete(&self) -> bool {
        match self.kind {
            ResourceKind::Deployment => {
                let replicas_ready = match self.count("replicas") {
                    None => true,
                    Some(replicas) => self.count("readyReplicas").unwrap_or(0) == replicas,
                };
                self.condition_true("Progressing")
                    && self.condition_true("Available")
                    && replicas_ready
            }
            ResourceKind::Job | ResourceKind::Pod => {
                if self.condition_true("Complete") || self.condition_true("Failed") {
                    return true;
                }
                // A bare Pod never gets Complete/Failed conditions from the
                // kubelet; its terminal state is only visible in status.phase.
                self.kind == ResourceKind::Pod
                    && self.condition("Complete").is_none()
                    && self.condition("Failed").is_none()
                    && matches!(self.phase(), Some("Succeeded") | Some("Failed"))
            }
            // Nothing to wait for on kinds without a rollout.
            ResourceKind::Service | ResourceKind::ConfigMap | ResourceKind::Ingress => true,
        }
    }

    pub fn is_healthy(&self) -> bool {
        if !self.is_complete() {
            return false;
        }
        match self.kind {
            ResourceKind::Deployment => self.count("replicas").is_some(),
            ResourceKind::Job | ResourceKind::Pod => {
                let conditions_present =
                    self.condition("Complete").is_some() || self.condition("Failed").is_some();
                // Same phase fallback as is_complete.
                if self.kind == ResourceKind::Pod && !conditions_present {
                    return self.phase() == Some("Succeeded");
                }
                self.condition_true("Complete") && !self.condition_true("Failed")
            }
            ResourceKind::Service | ResourceKind::ConfigMap | ResourceKind::Ingress => true,
        }
    }
}
