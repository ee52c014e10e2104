//! Lifecycle of per-subset config branches.
//!
//! A subset's settings live on their own branch, forked from an upstream
//! (normally the root branch). Branches are created lazily, can be rebuilt
//! from scratch, and are carried forward by fast-forward only: a diverged
//! branch is reported and left for a human.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use git2::Oid;
use serde_yaml::Value;

use crate::git::{ConfigRepo, MergeOutcome};
use crate::settings::{get_path, parse_document, set_path};
use crate::{plog, plog_debug, Error, Result};

pub const SUBSET_FILE: &str = "subset.yaml";
pub const IMAGE_TAG_KEY: &str = "deployment.image.tag";

pub fn service_file(service: &str) -> PathBuf {
    Path::new("services").join(format!("{}.yaml", service))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Establish {
    Existing,
    Created,
}

/// One hop of a dovetail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DovetailStep {
    pub branch: String,
    pub outcome: MergeOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRepoBranch {
    pub name: String,
    /// Branch this one is forked from and carried forward with.
    pub upstream: String,
    /// Managed branches are created and rebuilt by poolshift; unmanaged ones
    /// must already exist.
    pub managed: bool,
    root: String,
}

impl ConfigRepoBranch {
    pub fn managed(name: impl Into<String>, upstream: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            upstream: upstream.into(),
            managed: true,
            root: root.into(),
        }
    }

    /// The root branch itself, tracking its remote counterpart.
    pub fn root(root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            name: root.clone(),
            upstream: root.clone(),
            managed: false,
            root,
        }
    }

    pub fn is_root(&self) -> bool {
        self.name == self.root
    }

    pub fn establish(&self, repo: &ConfigRepo) -> Result<Establish> {
        repo.fetch()?;
        if !self.managed {
            if !repo.branch_exists(&self.name)? {
                return Err(Error::logical(format!(
                    "unmanaged branch '{}' does not exist",
                    self.name
                )));
            }
            repo.checkout(&self.name)?;
            return Ok(Establish::Existing);
        }

        if repo.remote_branch_exists(&self.name)? {
            repo.checkout(&self.name)?;
            return Ok(Establish::Existing);
        }
        if repo.local_branch_exists(&self.name)? {
            plog!(repo.log(), "Discarding stale local copy of {}", self.name);
            repo.delete_local_branch(&self.name)?;
        }

        let from = repo.resolve(&self.upstream)?;
        repo.create_branch(&self.name, from)?;
        repo.push(&self.name)?;
        repo.fetch()?;
        repo.checkout(&self.name)?;
        plog!(
            repo.log(),
            "Created {} from {} at {:.7}",
            self.name,
            self.upstream,
            from
        );
        Ok(Establish::Created)
    }

    pub fn rebuild(&self, repo: &ConfigRepo) -> Result<()> {
        if !self.managed {
            return Err(Error::logical(format!(
                "refusing to rebuild unmanaged branch '{}'",
                self.name
            )));
        }
        repo.fetch()?;
        repo.delete_remote_branch(&self.name)?;
        repo.delete_local_branch(&self.name)?;
        self.establish(repo)?;
        Ok(())
    }

    /// Carry this branch forward. Without a source the branch catches up
    /// with its upstream; with one, the source flows into the upstream and
    /// then into this branch. The hop into the root branch is never taken.
    pub fn dovetail(&self, repo: &ConfigRepo, source: Option<&str>) -> Result<Vec<DovetailStep>> {
        if source == Some(self.name.as_str()) {
            plog!(repo.log(), "{} is already its own source; nothing to dovetail", self.name);
            return Ok(Vec::new());
        }
        if self.is_root() && source.is_some() {
            return Err(Error::logical(format!(
                "refusing to merge into the root branch '{}'",
                self.name
            )));
        }

        repo.fetch()?;
        let mut steps = Vec::new();

        if self.is_root() {
            let outcome = repo.checkout(&self.name)?;
            steps.push(DovetailStep {
                branch: self.name.clone(),
                outcome,
            });
            return Ok(steps);
        }

        let target = match source {
            None => repo.resolve(&self.upstream)?,
            Some(source) if self.upstream == self.root => {
                plog_debug!(
                    repo.log(),
                    "Upstream of {} is the root branch; merging {} directly",
                    self.name,
                    source
                );
                repo.resolve(source)?
            }
            Some(source) => {
                let source_oid = repo.resolve(source)?;
                steps.push(self.advance(repo, &self.upstream, source_oid)?);
                repo.resolve(&self.upstream)?
            }
        };
        steps.push(self.advance(repo, &self.name, target)?);
        Ok(steps)
    }

    fn advance(&self, repo: &ConfigRepo, branch: &str, target: Oid) -> Result<DovetailStep> {
        repo.checkout(branch)?;
        let outcome = repo.fast_forward(branch, target)?;
        if outcome != MergeOutcome::UpToDate {
            repo.push(branch)?;
            repo.fetch()?;
            plog!(repo.log(), "Dovetailed {} to {:.7}", branch, target);
        }
        Ok(DovetailStep {
            branch: branch.to_string(),
            outcome,
        })
    }

    /// Set dotted keys in `subset.yaml`. Commits and pushes only when a value
    /// actually changes.
    pub fn write_subset_config(
        &self,
        repo: &ConfigRepo,
        values: &BTreeMap<String, Value>,
        message: &str,
    ) -> Result<Option<Oid>> {
        let edits: BTreeMap<PathBuf, BTreeMap<String, Value>> =
            [(PathBuf::from(SUBSET_FILE), values.clone())].into_iter().collect();
        self.write_settings(repo, &edits, message)
    }

    /// Point each service's `deployment.image.tag` at a new tag. Only files
    /// whose tag differs are rewritten, all in one commit.
    pub fn write_image_tags(&self, repo: &ConfigRepo, tags: &BTreeMap<String, String>) -> Result<Option<Oid>> {
        let edits: BTreeMap<PathBuf, BTreeMap<String, Value>> = tags
            .iter()
            .map(|(service, tag)| {
                let values = [(IMAGE_TAG_KEY.to_string(), Value::String(tag.clone()))]
                    .into_iter()
                    .collect();
                (service_file(service), values)
            })
            .collect();
        let summary: Vec<String> = tags.iter().map(|(s, t)| format!("{}={}", s, t)).collect();
        self.write_settings(repo, &edits, &format!("Set image tags on {}: {}", self.name, summary.join(", ")))
    }

    /// Apply dotted-key edits to YAML files on this branch. Values are diffed
    /// against what is committed; untouched files are never rewritten. After
    /// pushing, the committed files are read back and every edit verified.
    pub fn write_settings(
        &self,
        repo: &ConfigRepo,
        edits: &BTreeMap<PathBuf, BTreeMap<String, Value>>,
        message: &str,
    ) -> Result<Option<Oid>> {
        repo.checkout(&self.name)?;

        let mut changed = Vec::new();
        for (path, values) in edits {
            let committed = repo.read_committed(&self.name, path)?;
            let mut doc = parse_document(committed.as_deref())?;
            let stale: Vec<&String> = values
                .iter()
                .filter(|(key, value)| get_path(&doc, key) != Some(*value))
                .map(|(key, _)| key)
                .collect();
            if stale.is_empty() {
                continue;
            }
            plog_debug!(repo.log(), "{}:{} changing {:?}", self.name, path.display(), stale);
            for (key, value) in values {
                set_path(&mut doc, key, value.clone());
            }
            repo.write_file(path, &serde_yaml::to_string(&doc)?)?;
            changed.push(path.clone());
        }

        if changed.is_empty() {
            plog_debug!(repo.log(), "{} already up to date", self.name);
            return Ok(None);
        }

        let oid = repo.commit_paths(&changed, message)?;
        repo.push(&self.name)?;
        self.verify(repo, edits)?;
        Ok(oid)
    }

    fn verify(&self, repo: &ConfigRepo, edits: &BTreeMap<PathBuf, BTreeMap<String, Value>>) -> Result<()> {
        let mut missing = Vec::new();
        for (path, values) in edits {
            let doc = parse_document(repo.read_committed(&self.name, path)?.as_deref())?;
            for (key, value) in values {
                if get_path(&doc, key) != Some(value) {
                    missing.push(format!("{}:{}", path.display(), key));
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::logical(format!(
                "settings on {} only partially applied; missing {}",
                self.name,
                missing.join(", ")
            )))
        }
    }

    /// Delete local and remote copies of this branch.
    pub fn delete(&self, repo: &ConfigRepo) -> Result<()> {
        if !self.managed {
            return Err(Error::logical(format!(
                "refusing to delete unmanaged branch '{}'",
                self.name
            )));
        }
        repo.delete_remote_branch(&self.name)?;
        repo.delete_local_branch(&self.name)
    }
}

