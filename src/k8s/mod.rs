//! Kubernetes boundary.
//!
//! The orchestrator never talks to the API server directly. It consumes two
//! traits, a resource accessor for CRUD and status reads and an in-pod exec
//! primitive, so tests and alternative transports can stand in for the
//! bundled [`KubectlClient`].

mod kubectl;
mod resource;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub use kubectl::KubectlClient;
pub(crate) use resource::json_path;
pub use resource::{Resource, ResourceKind, ResourceRef};

/// CRUD plus status reads for cluster objects in one namespace.
#[async_trait]
pub trait ResourceAccessor: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<Resource>>;

    async fn list(&self, kind: ResourceKind, selector: &str) -> Result<Vec<Resource>>;

    async fn create(&self, definition: &Resource) -> Result<Resource>;

    async fn replace(&self, definition: &Resource) -> Result<Resource>;

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()>;

    /// The object's `status` stanza from the status subresource.
    async fn status(&self, kind: ResourceKind, name: &str) -> Result<Value>;

    /// Replace when present, create otherwise.
    async fn apply(&self, definition: &Resource) -> Result<Resource> {
        match self.get(definition.kind(), definition.name()).await? {
            Some(_) => self.replace(definition).await,
            None => self.create(definition).await,
        }
    }
}

/// Run a command inside a pod and collect its stdout.
///
/// Implementations enforce their own fixed timeout. Cancelling the token
/// must also stop the remote command.
#[async_trait]
pub trait PodExec: Send + Sync {
    async fn exec(&self, pod: &str, argv: &[String], cancel: &CancellationToken)
        -> Result<Vec<u8>>;
}
