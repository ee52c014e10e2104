//! The deployed application as seen through its environment record, its
//! config branches and the cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::batch::BatchOperation;
use crate::branch::{ConfigRepoBranch, SUBSET_FILE};
use crate::environment::{Environment, Pool, SubsetVersion};
use crate::k8s::{Resource, ResourceAccessor, ResourceKind, ResourceRef};
use crate::render::ConfigRenderer;
use crate::git::SharedRepo;
use crate::{plog, plog_debug, Context, Error, Result};

/// Routing resources carry this annotation to say which pool they serve.
pub const POOL_ANNOTATION: &str = "poolshift.io/pool";

pub struct Application {
    ctx: Context,
    repo: SharedRepo,
    accessor: Arc<dyn ResourceAccessor>,
    renderer: Arc<dyn ConfigRenderer>,
}

impl Application {
    pub fn new(
        ctx: Context,
        repo: SharedRepo,
        accessor: Arc<dyn ResourceAccessor>,
        renderer: Arc<dyn ConfigRenderer>,
    ) -> Self {
        Self {
            ctx,
            repo,
            accessor,
            renderer,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn repo(&self) -> &SharedRepo {
        &self.repo
    }

    pub fn accessor(&self) -> &Arc<dyn ResourceAccessor> {
        &self.accessor
    }

    pub fn root_branch(&self) -> ConfigRepoBranch {
        ConfigRepoBranch::root(self.ctx.config.repo.root_branch.clone())
    }

    pub fn subset_branch(&self, env: &Environment, version: SubsetVersion) -> Result<ConfigRepoBranch> {
        let record = env.subset(version)?;
        let repo = &self.ctx.config.repo;
        let name = record
            .branch
            .clone()
            .unwrap_or_else(|| repo.subset_branch(&version.to_string()));
        Ok(ConfigRepoBranch::managed(name, repo.root_branch.clone(), repo.root_branch.clone()))
    }

    pub async fn load_environment(&self) -> Result<Environment> {
        let root = self.ctx.config.repo.root_branch.clone();
        let file = self.ctx.config.repo.environment_file();
        self.repo
            .with(move |repo| {
                repo.fetch()?;
                repo.checkout(&root)?;
                let text = repo.read_committed(&root, &file)?.ok_or_else(|| {
                    Error::logical(format!("{} not found on {}", file.display(), root))
                })?;
                Environment::parse(&text)
            })
            .await
    }

    /// Load, mutate, save, commit and push the environment as one step while
    /// holding the working copy. Nothing is committed when `mutate` leaves
    /// the record unchanged.
    pub async fn update_environment<F>(&self, message: &str, mutate: F) -> Result<Environment>
    where
        F: FnOnce(&mut Environment) -> Result<()> + Send + 'static,
    {
        let root = self.ctx.config.repo.root_branch.clone();
        let file = self.ctx.config.repo.environment_file();
        let message = message.to_string();
        let log = self.ctx.log.clone();
        self.repo
            .with(move |repo| {
                repo.fetch()?;
                repo.checkout(&root)?;
                let text = repo.read_committed(&root, &file)?.ok_or_else(|| {
                    Error::logical(format!("{} not found on {}", file.display(), root))
                })?;
                let before = Environment::parse(&text)?;
                let mut env = before.clone();
                mutate(&mut env)?;
                if env == before {
                    plog_debug!(log, "Environment unchanged; skipping commit ({})", message);
                    return Ok(env);
                }
                repo.write_file(&file, &env.to_yaml()?)?;
                if repo.commit_paths(&[file.clone()], &message)?.is_some() {
                    repo.push(&root)?;
                    plog!(log, "Committed environment: {}", message);
                }
                Ok(env)
            })
            .await
    }

    /// Commit the subset's test-pool flag and push the settings to the cluster.
    pub async fn set_test_pool_flag(&self, version: SubsetVersion, on: bool) -> Result<()> {
        let env = self.load_environment().await?;
        let branch = self.subset_branch(&env, version)?;
        let key = self.ctx.config.fleet.flag_field.clone();
        let message = format!("Set {} {}={}", version, key, on);
        plog!(self.ctx.log, "{}", message);

        let values: BTreeMap<String, serde_yaml::Value> =
            [(key, serde_yaml::Value::Bool(on))].into_iter().collect();
        let writer = branch.clone();
        self.repo
            .with(move |repo| {
                writer.establish(repo)?;
                writer.write_subset_config(repo, &values, &message)
            })
            .await?;
        self.apply_subset_settings(version, &branch).await
    }

    /// Publish the committed `subset.yaml` as the subset's settings ConfigMap.
    pub async fn apply_subset_settings(&self, version: SubsetVersion, branch: &ConfigRepoBranch) -> Result<()> {
        let name = branch.name.clone();
        let settings = self
            .repo
            .with(move |repo| {
                Ok(repo
                    .read_committed(&name, std::path::Path::new(SUBSET_FILE))?
                    .unwrap_or_default())
            })
            .await?;
        let fleet = &self.ctx.config.fleet;
        let config_map = Resource::new(
            ResourceKind::ConfigMap,
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {
                    "name": version.resource_name("subset-settings"),
                    "labels": { fleet.subset_label.as_str(): version.to_string() },
                },
                "data": { SUBSET_FILE: settings },
            }),
        );
        self.accessor.apply(&config_map).await?;
        plog_debug!(self.ctx.log, "Applied {}", config_map.reference());
        Ok(())
    }

    /// Apply every document of a manifest in order.
    pub async fn apply_manifest(&self, resources: Vec<Resource>) -> Result<Vec<ResourceRef>> {
        let batch = BatchOperation::new(resources)
            .run_each(move |resource| async move {
                self.accessor.apply(&resource).await?;
                Ok::<_, Error>(resource.reference())
            })
            .await;
        Ok(batch.raise_errors()?)
    }

    /// Render the inbound routing and point each pool's selector at the
    /// subset the environment binds it to.
    pub async fn apply_routing(&self, env: &Environment) -> Result<Vec<ResourceRef>> {
        let text = self.renderer.render("routing").await?;
        let subset_label = &self.ctx.config.fleet.subset_label;
        let mut resources = Resource::parse_manifest(&text)?;
        for resource in &mut resources {
            let Some(pool) = resource.annotation(POOL_ANNOTATION) else {
                continue;
            };
            let pool: Pool = pool.parse()?;
            let version = env.pool(pool);
            let mut selector = resource
                .get("spec.selector")
                .cloned()
                .unwrap_or_else(|| json!({}));
            selector[subset_label.as_str()] = Value::String(version.to_string());
            resource.set("spec.selector", selector);
            plog_debug!(self.ctx.log, "Routing {} ({}) to {}", resource.reference(), pool, version);
        }
        let applied = self.apply_manifest(resources).await?;
        plog!(
            self.ctx.log,
            "Routing applied: prod -> {}, test -> {}",
            env.pools.prod,
            env.pools.test
        );
        Ok(applied)
    }

    pub async fn dequeue_rollout(&self, target: &ResourceRef) -> Result<()> {
        let dequeued = target.clone();
        self.update_environment(&format!("Rollout of {} complete", target), move |env| {
            env.dequeue(&dequeued);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Services carrying the test-pool flag: from the environment, or from
    /// the `services` settings when the environment lists none.
    pub async fn flagged_services(&self, env: &Environment) -> Result<Vec<String>> {
        if !env.services.is_empty() {
            return Ok(env.services.clone());
        }
        let config = self.renderer.get_config("services").await?;
        Ok(serde_yaml::from_value(config)?)
    }

    /// Delete managed subset branches the environment no longer references.
    pub async fn prune_branches(&self) -> Result<Vec<String>> {
        let env = self.load_environment().await?;
        let referenced: Vec<String> = env
            .subsets
            .keys()
            .map(|v| self.subset_branch(&env, *v).map(|b| b.name))
            .collect::<Result<_>>()?;
        let prefix = format!("{}-", self.ctx.config.repo.environment);
        let root = self.ctx.config.repo.root_branch.clone();
        let log = self.ctx.log.clone();
        self.repo
            .with(move |repo| {
                repo.fetch()?;
                let mut deleted = Vec::new();
                for name in repo.branches()? {
                    let is_subset_branch = name
                        .strip_prefix(&prefix)
                        .map(|suffix| suffix.parse::<SubsetVersion>().is_ok())
                        .unwrap_or(false);
                    if !is_subset_branch || referenced.contains(&name) {
                        continue;
                    }
                    ConfigRepoBranch::managed(name.as_str(), root.as_str(), root.as_str()).delete(repo)?;
                    plog!(log, "Pruned unreferenced branch {}", name);
                    deleted.push(name);
                }
                Ok(deleted)
            })
            .await
    }
}
