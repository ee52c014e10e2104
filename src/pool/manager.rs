use std::sync::Arc;

use crate::application::Application;
use crate::environment::{Environment, Pool, SubsetVersion};
use crate::health::{HealthcheckManager, TestPoolStateChecker};
use crate::log::Logger;
use crate::{plog, plog_error, plog_warn, Context, Error, Result};

/// Pool bindings after a completed swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapReport {
    pub prod: SubsetVersion,
    pub test: SubsetVersion,
    /// Whether the subset that left prod confirmed its new test-pool role.
    pub descending_converged: bool,
}

/// Drives the blue/green protocol.
pub struct PoolManager {
    pub(super) app: Arc<Application>,
    pub(super) health: Arc<HealthcheckManager>,
    fleet: TestPoolStateChecker,
    pub(super) log: Logger,
    attempts: u32,
    pub(super) chunk_size: usize,
}

impl PoolManager {
    pub fn new(ctx: &Context, app: Arc<Application>, health: Arc<HealthcheckManager>) -> Self {
        Self {
            fleet: TestPoolStateChecker::new(ctx, health.clone()),
            app,
            health,
            log: ctx.log.clone(),
            attempts: ctx.config.swap.attempts.max(1),
            chunk_size: ctx.config.fleet.chunk_size,
        }
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.app
    }

    /// Exchange the prod and test pools.
    ///
    /// The ascending subset (currently test) first stops answering as the
    /// test pool and the fleet must confirm it. Only then are the pointers
    /// swapped and routing re-applied. The descending subset is finally
    /// flagged as the test pool; failures there are logged, not raised,
    /// since the swap itself is already committed.
    pub async fn swap(&self) -> Result<SwapReport> {
        let env = self.app.load_environment().await?;
        let ascending = env.pools.test;
        let descending = env.pools.prod;
        if ascending == descending {
            return Err(Error::logical(format!(
                "prod and test are both bound to {}; nothing to swap",
                ascending
            )));
        }
        self.check_reachable(&env).await?;
        let services = self.app.flagged_services(&env).await?;

        plog!(self.log, "Swapping pools: {} ascends to prod, {} descends to test", ascending, descending);

        let stepped_off = async {
            self.app.set_test_pool_flag(ascending, false).await?;
            self.converge(ascending, false, &services).await
        }
        .await;
        if let Err(err) = stepped_off {
            plog_error!(self.log, "{} did not leave the test pool: {}; rolling back", ascending, err);
            if let Err(rollback) = self.app.set_test_pool_flag(ascending, true).await {
                plog_error!(self.log, "Rollback of {} failed: {}", ascending, rollback);
            }
            return Err(err);
        }

        let env = self
            .app
            .update_environment(
                &format!("Swap pools: prod {} -> {}, test {} -> {}", descending, ascending, ascending, descending),
                move |env| {
                    if env.pools.prod != descending || env.pools.test != ascending {
                        return Err(Error::logical(format!(
                            "pools changed during swap (now prod {}, test {})",
                            env.pools.prod, env.pools.test
                        )));
                    }
                    env.swap_pools();
                    Ok(())
                },
            )
            .await?;
        self.app.apply_routing(&env).await?;

        let stepped_on = async {
            self.app.set_test_pool_flag(descending, true).await?;
            self.converge(descending, true, &services).await
        }
        .await;
        let descending_converged = match stepped_on {
            Ok(()) => true,
            Err(err) => {
                plog_warn!(self.log, "{} did not confirm the test pool: {}", descending, err);
                false
            }
        };

        plog!(self.log, "Swap complete: prod={}, test={}", env.pools.prod, env.pools.test);
        Ok(SwapReport {
            prod: env.pools.prod,
            test: env.pools.test,
            descending_converged,
        })
    }

    /// Promote the newer test subset to prod.
    pub async fn roll_forward(&self) -> Result<SwapReport> {
        let env = self.app.load_environment().await?;
        if env.pools.prod > env.pools.test {
            return Err(Error::logical(format!(
                "cannot roll forward: prod {} is newer than test {}",
                env.pools.prod, env.pools.test
            )));
        }
        self.swap().await
    }

    /// Return prod to the older test subset.
    pub async fn roll_back(&self) -> Result<SwapReport> {
        let env = self.app.load_environment().await?;
        if env.pools.prod < env.pools.test {
            return Err(Error::logical(format!(
                "cannot roll back: prod {} is older than test {}",
                env.pools.prod, env.pools.test
            )));
        }
        self.swap().await
    }

    /// Set every pooled subset's flag to match the current pointers and wait
    /// for the fleet to agree. A subset backing both pools serves prod.
    pub async fn align(&self) -> Result<()> {
        let env = self.app.load_environment().await?;
        let services = self.app.flagged_services(&env).await?;
        let mut wanted = vec![(env.pools.prod, false)];
        if env.pools.test != env.pools.prod {
            wanted.push((env.pools.test, true));
        }
        for (version, on) in wanted {
            self.app.set_test_pool_flag(version, on).await?;
            self.converge(version, on, &services).await?;
        }
        self.app.apply_routing(&env).await?;
        plog!(self.log, "Aligned: prod={}, test={}", env.pools.prod, env.pools.test);
        Ok(())
    }

    /// Bind the test pool to `version`.
    pub async fn promote(&self, version: SubsetVersion) -> Result<()> {
        let env = self.app.load_environment().await?;
        env.subset(version)?;
        if env.pools.test == version {
            plog!(self.log, "{} already backs the test pool", version);
            return Ok(());
        }
        self.health.liveness(version).await?;
        let services = self.app.flagged_services(&env).await?;
        if env.pools.prod != version {
            self.app.set_test_pool_flag(version, true).await?;
            self.converge(version, true, &services).await?;
        }
        let env = self
            .app
            .update_environment(&format!("Promote {} to the test pool", version), move |env| {
                env.subset(version)?;
                env.set_pool(Pool::Test, version);
                Ok(())
            })
            .await?;
        self.app.apply_routing(&env).await?;
        plog!(self.log, "{} now backs the test pool", version);
        Ok(())
    }

    async fn check_reachable(&self, env: &Environment) -> Result<()> {
        for pool in [Pool::Prod, Pool::Test] {
            let version = env.pool(pool);
            self.health.liveness(version).await.map_err(|e| {
                Error::logical(format!("{} pool ({}) is not reachable: {}", pool, version, e))
            })?;
        }
        Ok(())
    }

    /// Wait for fleet agreement, giving each attempt the full time budget.
    async fn converge(&self, version: SubsetVersion, expected: bool, services: &[String]) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.fleet.await_agreement(version, services, expected).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    plog_warn!(
                        self.log,
                        "{} not in agreement (attempt {}/{})",
                        version,
                        attempt,
                        self.attempts
                    );
                    last_error = None;
                }
                Err(e) => {
                    plog_warn!(
                        self.log,
                        "Checking {} failed (attempt {}/{}): {}",
                        version,
                        attempt,
                        self.attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::logical(format!(
                "{} services did not agree on the test-pool flag being {} after {} attempts",
                version, expected, self.attempts
            ))
        }))
    }
}
