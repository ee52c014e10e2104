//! Waiting for applied resources to reach a terminal cluster state.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::batch::BatchOperation;
use crate::k8s::{ResourceAccessor, ResourceRef};
use crate::log::Logger;
use crate::{plog, plog_debug, plog_warn, Context, Error, Result};

use super::poll::{poll_until, Poll, PollOutcome};
use super::ResourceStatus;

/// Called once per resource that completed healthy, before the batch settles.
pub type CompletionHook =
    Arc<dyn Fn(ResourceRef, ResourceStatus) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Terminal state of one status wait.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Healthy(ResourceStatus),
    Unhealthy(ResourceStatus),
    TimedOut { elapsed: Duration },
}

impl Completion {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Completion::Healthy(_))
    }
}

/// Polls resource status until a kind-specific completion predicate holds.
pub struct StatusManager {
    accessor: Arc<dyn ResourceAccessor>,
    log: Logger,
    rest: Duration,
    timeout: Duration,
}

impl StatusManager {
    pub fn new(ctx: &Context, accessor: Arc<dyn ResourceAccessor>) -> Self {
        Self {
            accessor,
            log: ctx.log.clone(),
            rest: ctx.config.polling.rest(),
            timeout: ctx.config.polling.timeout(),
        }
    }

    pub fn with_timing(mut self, rest: Duration, timeout: Duration) -> Self {
        self.rest = rest;
        self.timeout = timeout;
        self
    }

    pub async fn fetch(&self, target: &ResourceRef) -> Result<ResourceStatus> {
        let status = self
            .accessor
            .status(target.kind, &target.name)
            .await
            .map_err(|e| match e {
                Error::Transport { .. } => e,
                other => Error::transport(format!("status {}", target), other),
            })?;
        Ok(ResourceStatus::new(target.kind, status))
    }

    /// Poll one resource to completion. A timeout is reported, not raised.
    pub async fn wait_until_complete(&self, target: &ResourceRef) -> Result<Completion> {
        plog_debug!(self.log, "Waiting for {} (timeout {:?})", target, self.timeout);
        let outcome = poll_until(self.rest, self.timeout, move || async move {
            let status = self.fetch(target).await?;
            if status.is_complete() {
                Ok(Poll::Ready(status))
            } else {
                plog_debug!(self.log, "{} not complete yet", target);
                Ok(Poll::Pending)
            }
        })
        .await?;

        let completion = match outcome {
            PollOutcome::Ready(status) if status.is_healthy() => Completion::Healthy(status),
            PollOutcome::Ready(status) => Completion::Unhealthy(status),
            PollOutcome::TimedOut { elapsed } => Completion::TimedOut { elapsed },
        };
        match &completion {
            Completion::Healthy(_) => plog!(self.log, "{} completed healthy", target),
            Completion::Unhealthy(_) => plog_warn!(self.log, "{} completed unhealthy", target),
            Completion::TimedOut { elapsed } => {
                plog_warn!(self.log, "{} did not complete within {:?}", target, elapsed)
            }
        }
        Ok(completion)
    }

    /// Wait on every target concurrently; raise once if any of them did not
    /// complete healthy. `on_complete` runs for each healthy target as soon as
    /// it is observed.
    pub async fn wait_until_all_complete(
        &self,
        targets: Vec<ResourceRef>,
        on_complete: Option<CompletionHook>,
    ) -> Result<Vec<ResourceRef>> {
        let batch = BatchOperation::new(targets)
            .run(move |target| {
                let hook = on_complete.clone();
                async move {
                    match self.wait_until_complete(&target).await? {
                        Completion::Healthy(status) => {
                            if let Some(hook) = hook {
                                hook(target.clone(), status).await?;
                            }
                            Ok(target)
                        }
                        Completion::Unhealthy(_) => Err(Error::logical(format!(
                            "{} completed but is not healthy",
                            target
                        ))),
                        Completion::TimedOut { elapsed } => Err(Error::Timeout {
                            what: target.to_string(),
                            elapsed,
                        }),
                    }
                }
            })
            .await;
        Ok(batch.raise_errors()?)
    }
}
