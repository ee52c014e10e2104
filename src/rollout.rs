//! Waiting on a queued rollout.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::application::Application;
use crate::k8s::ResourceRef;
use crate::status::{CompletionHook, ResourceStatus, StatusManager};
use crate::{plog, Result};

/// Wait for every job and service queued in the environment's rollout
/// request. Each entry is de-queued (committed and pushed) as soon as it is
/// observed healthy, so an interrupted wait resumes with what is left.
pub async fn await_rollout(app: Arc<Application>, status: &StatusManager) -> Result<Vec<ResourceRef>> {
    let env = app.load_environment().await?;
    let Some(request) = env.rollout.filter(|r| !r.is_empty()) else {
        plog!(app.context().log, "No rollout queued");
        return Ok(Vec::new());
    };
    let targets = request.targets();
    plog!(app.context().log, "Waiting for {} queued rollout target(s)", targets.len());

    let hook_app = app.clone();
    let hook: CompletionHook = Arc::new(move |target: ResourceRef, _status: ResourceStatus| -> BoxFuture<'static, Result<()>> {
        let app = hook_app.clone();
        Box::pin(async move { app.dequeue_rollout(&target).await })
    });
    let completed = status.wait_until_all_complete(targets, Some(hook)).await?;
    plog!(app.context().log, "Rollout complete ({} target(s))", completed.len());
    Ok(completed)
}
