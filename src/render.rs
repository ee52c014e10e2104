//! Manifest rendering boundary.
//!
//! The orchestrator asks for manifests and structured settings by name and
//! never renders anything itself. [`RepoRenderer`] serves pre-rendered files
//! committed to the config repository.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_yaml::Value;

use crate::git::SharedRepo;
use crate::{Error, Result};

#[async_trait]
pub trait ConfigRenderer: Send + Sync {
    /// Manifest text (one or more YAML documents) for a named template.
    async fn render(&self, template: &str) -> Result<String>;

    /// Structured settings by name.
    async fn get_config(&self, name: &str) -> Result<Value>;
}

/// Reads `manifests/<template>.yaml` and `config/<name>.yaml` as committed
/// on one branch.
pub struct RepoRenderer {
    repo: SharedRepo,
    branch: String,
}

impl RepoRenderer {
    pub fn new(repo: SharedRepo, branch: impl Into<String>) -> Self {
        Self {
            repo,
            branch: branch.into(),
        }
    }

    pub fn manifest_path(template: &str) -> PathBuf {
        Path::new("manifests").join(format!("{}.yaml", template))
    }

    pub fn config_path(name: &str) -> PathBuf {
        Path::new("config").join(format!("{}.yaml", name))
    }

    async fn read(&self, rel: PathBuf) -> Result<String> {
        let branch = self.branch.clone();
        self.repo
            .with(move |repo| {
                repo.read_committed(&branch, &rel)?.ok_or_else(|| {
                    Error::logical(format!("{} not found on {}", rel.display(), branch))
                })
            })
            .await
    }
}

#[async_trait]
impl ConfigRenderer for RepoRenderer {
    async fn render(&self, template: &str) -> Result<String> {
        self.read(Self::manifest_path(template)).await
    }

    async fn get_config(&self, name: &str) -> Result<Value> {
        let text = self.read(Self::config_path(name)).await?;
        Ok(serde_yaml::from_str(&text)?)
    }
}
