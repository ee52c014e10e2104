use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::environment::SubsetVersion;
use crate::log::Logger;
use crate::status::{poll_until, Poll, PollOutcome};
use crate::{plog, plog_debug, Context, Result};

use super::{FleetVerdict, HealthcheckManager, ProbeSpec};

/// Watches the test-pool flag as reported by the running fleet.
pub struct TestPoolStateChecker {
    health: Arc<HealthcheckManager>,
    probe_argv: Vec<String>,
    field: String,
    interval: Duration,
    attempt_timeout: Duration,
    log: Logger,
}

impl TestPoolStateChecker {
    pub fn new(ctx: &Context, health: Arc<HealthcheckManager>) -> Self {
        Self {
            health,
            probe_argv: ctx.config.fleet.flag_probe.clone(),
            field: ctx.config.fleet.flag_field.clone(),
            interval: ctx.config.swap.interval(),
            attempt_timeout: ctx.config.swap.attempt_timeout(),
            log: ctx.log.clone(),
        }
    }

    pub fn probe(&self, expected: bool) -> ProbeSpec {
        ProbeSpec {
            argv: self.probe_argv.clone(),
            field: self.field.clone(),
            expected: Value::Bool(expected),
        }
    }

    pub async fn verdict(&self, version: SubsetVersion, services: &[String], expected: bool) -> FleetVerdict {
        self.health.check(version, services, &self.probe(expected)).await
    }

    /// Poll until every service of `version` agrees the flag is `expected`.
    /// `Ok(false)` when the attempt's time budget runs out first.
    pub async fn await_agreement(&self, version: SubsetVersion, services: &[String], expected: bool) -> Result<bool> {
        plog!(
            self.log,
            "Waiting for {} to report {}={} on {} service(s)",
            version,
            self.field,
            expected,
            services.len()
        );
        let outcome = poll_until(self.interval, self.attempt_timeout, move || async move {
            let verdict = self.verdict(version, services, expected).await;
            if verdict.all_correct {
                Ok(Poll::Ready(()))
            } else {
                plog_debug!(
                    self.log,
                    "{} not yet in agreement: {:?}",
                    version,
                    verdict.incorrect_services()
                );
                Ok(Poll::Pending)
            }
        })
        .await?;
        Ok(matches!(outcome, PollOutcome::Ready(())))
    }
}
