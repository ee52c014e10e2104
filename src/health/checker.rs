use std::collections::{BTreeMap, HashSet};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchOperation;
use crate::config::FleetConfig;
use crate::environment::SubsetVersion;
use crate::k8s::{json_path, PodExec, Resource, ResourceAccessor, ResourceKind};
use crate::log::Logger;
use crate::{plog, plog_debug, plog_warn, Context, Error, Result};

/// What to run in each pod and what a correct answer looks like.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSpec {
    pub argv: Vec<String>,
    /// Dotted path into the probe's JSON output.
    pub field: String,
    pub expected: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Correct,
    Incorrect(Value),
    /// The pod could not be asked, or its answer could not be read.
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodReading {
    pub pod: String,
    pub reading: Reading,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceVerdict {
    pub service: String,
    pub readings: Vec<PodReading>,
    /// At least one ready pod, and every ready pod answered correctly.
    pub correct: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FleetVerdict {
    pub services: BTreeMap<String, ServiceVerdict>,
    pub all_correct: bool,
}

impl FleetVerdict {
    pub fn incorrect_services(&self) -> Vec<&str> {
        self.services
            .values()
            .filter(|v| !v.correct)
            .map(|v| v.service.as_str())
            .collect()
    }
}

/// Execs probes inside every ready pod of a service and reduces the
/// readings. Never fails on a bad pod: the reading degrades instead.
pub struct HealthcheckManager {
    accessor: Arc<dyn ResourceAccessor>,
    exec: Arc<dyn PodExec>,
    fleet: FleetConfig,
    log: Logger,
    reported_not_ready: Mutex<HashSet<String>>,
}

impl HealthcheckManager {
    pub fn new(ctx: &Context, accessor: Arc<dyn ResourceAccessor>, exec: Arc<dyn PodExec>) -> Self {
        Self {
            accessor,
            exec,
            fleet: ctx.config.fleet.clone(),
            log: ctx.log.clone(),
            reported_not_ready: Mutex::new(HashSet::new()),
        }
    }

    pub fn exec_timeout(&self) -> Duration {
        self.fleet.exec_timeout()
    }

    pub async fn pods(&self, service: &str, version: SubsetVersion) -> Result<Vec<Resource>> {
        let selector = self.fleet.selector(service, &version.to_string());
        self.accessor.list(ResourceKind::Pod, &selector).await
    }

    /// Running with a `Ready=True` condition.
    pub fn is_ready(pod: &Resource) -> bool {
        let running = pod.get("status.phase").and_then(Value::as_str) == Some("Running");
        let ready = pod
            .get("status.conditions")
            .and_then(Value::as_array)
            .map(|conditions| {
                conditions.iter().any(|c| {
                    c.get("type").and_then(Value::as_str) == Some("Ready")
                        && c.get("status").and_then(Value::as_str) == Some("True")
                })
            })
            .unwrap_or(false);
        running && ready
    }

    fn note_not_ready(&self, pod: &str) {
        let first = match self.reported_not_ready.lock() {
            Ok(mut seen) => seen.insert(pod.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(pod.to_string()),
        };
        if first {
            plog!(self.log, "Pod {} is not ready; excluding it from health checks", pod);
        }
    }

    async fn ready_pods(&self, service: &str, version: SubsetVersion) -> Result<Vec<String>> {
        let mut ready = Vec::new();
        for pod in self.pods(service, version).await? {
            if Self::is_ready(&pod) {
                ready.push(pod.name().to_string());
            } else {
                self.note_not_ready(pod.name());
            }
        }
        Ok(ready)
    }

    /// Run `argv` in a pod, bounded by the exec timeout.
    pub async fn exec_in(&self, pod: &str, argv: &[String]) -> Result<Vec<u8>> {
        let token = CancellationToken::new();
        let limit = self.fleet.exec_timeout();
        match tokio::time::timeout(limit, self.exec.exec(pod, argv, &token)).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(Error::Timeout {
                    what: format!("exec in pod/{}", pod),
                    elapsed: limit,
                })
            }
        }
    }

    async fn probe_pod(&self, pod: &str, probe: &ProbeSpec) -> Reading {
        let stdout = match self.exec_in(pod, &probe.argv).await {
            Ok(stdout) => stdout,
            Err(e) => {
                plog_warn!(self.log, "Probe failed in pod/{}: {}", pod, e);
                return Reading::Unknown(e.to_string());
            }
        };
        let body: Value = match serde_json::from_slice(&stdout) {
            Ok(body) => body,
            Err(e) => return Reading::Unknown(format!("unreadable probe output: {}", e)),
        };
        match json_path(&body, &probe.field) {
            Some(value) if *value == probe.expected => Reading::Correct,
            Some(value) => Reading::Incorrect(value.clone()),
            None => Reading::Unknown(format!("probe output has no '{}'", probe.field)),
        }
    }

    /// Probe every ready pod of one service, one pod at a time.
    pub async fn check_service(&self, service: &str, version: SubsetVersion, probe: &ProbeSpec) -> ServiceVerdict {
        let pods = match self.ready_pods(service, version).await {
            Ok(pods) => pods,
            Err(e) => {
                plog_warn!(self.log, "Could not list pods for {} {}: {}", service, version, e);
                return ServiceVerdict {
                    service: service.to_string(),
                    readings: Vec::new(),
                    correct: false,
                };
            }
        };

        let batch = BatchOperation::new(pods)
            .run_each(move |pod| async move {
                let reading = self.probe_pod(&pod, probe).await;
                Ok::<_, Infallible>(PodReading { pod, reading })
            })
            .await;
        let readings = batch.results;
        let correct = !readings.is_empty() && readings.iter().all(|r| r.reading == Reading::Correct);
        if readings.is_empty() {
            plog_debug!(self.log, "{} {} has no ready pods", service, version);
        }
        ServiceVerdict {
            service: service.to_string(),
            readings,
            correct,
        }
    }

    /// Check every service of a subset concurrently.
    pub async fn check(&self, version: SubsetVersion, services: &[String], probe: &ProbeSpec) -> FleetVerdict {
        let batch = BatchOperation::new(services.iter().cloned())
            .run(move |service| async move {
                Ok::<_, Infallible>(self.check_service(&service, version, probe).await)
            })
            .await;
        let services: BTreeMap<String, ServiceVerdict> = batch
            .results
            .into_iter()
            .map(|verdict| (verdict.service.clone(), verdict))
            .collect();
        let all_correct = services.values().all(|v| v.correct);
        FleetVerdict { services, all_correct }
    }

    /// The subset's liveness service answers its probe from at least one
    /// ready pod.
    pub async fn liveness(&self, version: SubsetVersion) -> Result<()> {
        let service = &self.fleet.liveness_service;
        let pods = self.ready_pods(service, version).await?;
        if pods.is_empty() {
            return Err(Error::logical(format!(
                "subset {} has no ready {} pods",
                version, service
            )));
        }
        let mut last_error = None;
        for pod in &pods {
            match self.exec_in(pod, &self.fleet.liveness_probe).await {
                Ok(_) => {
                    plog_debug!(self.log, "{} {} is live (pod/{})", service, version, pod);
                    return Ok(());
                }
                Err(e) => {
                    plog_warn!(self.log, "Liveness probe failed in pod/{}: {}", pod, e);
                    last_error = Some(e);
                }
            }
        }
        Err(Error::logical(format!(
            "subset {} is not reachable: {}",
            version,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}
