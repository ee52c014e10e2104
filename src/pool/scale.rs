//! Scaling an idle subset to zero and back.

use serde_json::Value;

use crate::batch::BatchOperation;
use crate::environment::SubsetVersion;
use crate::k8s::{Resource, ResourceKind, ResourceRef};
use crate::{plog, plog_debug, Error, Result};

use super::PoolManager;

/// Replica count a deployment had before it was spun down.
pub const REPLICAS_ANNOTATION: &str = "poolshift.io/replicas-before-spin-down";

impl PoolManager {
    async fn idle_deployments(&self, version: SubsetVersion) -> Result<Vec<Resource>> {
        let env = self.app.load_environment().await?;
        if env.is_serving(version) {
            let names: Vec<&str> = env.pools_for(version).iter().map(|p| p.as_str()).collect();
            return Err(Error::logical(format!(
                "{} backs the {} pool; refusing to scale it",
                version,
                names.join(" and ")
            )));
        }
        let fleet = &self.app.context().config.fleet;
        let selector = format!("{}={}", fleet.subset_label, version);
        self.app
            .accessor()
            .list(ResourceKind::Deployment, &selector)
            .await
    }

    /// Scale every deployment of an idle subset to zero, remembering its
    /// replica count.
    pub async fn spin_down(&self, version: SubsetVersion) -> Result<Vec<ResourceRef>> {
        let deployments = self.idle_deployments(version).await?;
        plog!(self.log, "Spinning down {} deployment(s) of {}", deployments.len(), version);
        let batch = BatchOperation::new(deployments)
            .run_chunked(self.chunk_size, move |mut deployment| async move {
                let replicas = deployment
                    .get("spec.replicas")
                    .and_then(Value::as_u64)
                    .unwrap_or(1);
                if replicas == 0 {
                    plog_debug!(self.log, "{} already at zero", deployment.reference());
                    return Ok(deployment.reference());
                }
                deployment.set_annotation(REPLICAS_ANNOTATION, &replicas.to_string());
                deployment.set("spec.replicas", Value::from(0));
                self.app.accessor().replace(&deployment).await?;
                plog_debug!(self.log, "{} scaled {} -> 0", deployment.reference(), replicas);
                Ok::<_, Error>(deployment.reference())
            })
            .await;
        Ok(batch.raise_errors()?)
    }

    /// Restore replica counts recorded by [`PoolManager::spin_down`].
    pub async fn spin_up(&self, version: SubsetVersion) -> Result<Vec<ResourceRef>> {
        let deployments = self.idle_deployments(version).await?;
        plog!(self.log, "Spinning up {} deployment(s) of {}", deployments.len(), version);
        let batch = BatchOperation::new(deployments)
            .run_chunked(self.chunk_size, move |mut deployment| async move {
                let Some(recorded) = deployment.annotation(REPLICAS_ANNOTATION) else {
                    plog_debug!(self.log, "{} was not spun down", deployment.reference());
                    return Ok(deployment.reference());
                };
                let replicas: u64 = recorded.parse().map_err(|_| {
                    Error::logical(format!(
                        "{} has an unreadable {} annotation '{}'",
                        deployment.reference(),
                        REPLICAS_ANNOTATION,
                        recorded
                    ))
                })?;
                deployment.remove_annotation(REPLICAS_ANNOTATION);
                deployment.set("spec.replicas", Value::from(replicas));
                self.app.accessor().replace(&deployment).await?;
                plog_debug!(self.log, "{} scaled 0 -> {}", deployment.reference(), replicas);
                Ok::<_, Error>(deployment.reference())
            })
            .await;
        Ok(batch.raise_errors()?)
    }
}
