//! The environment record: which subset backs each pool, per-subset
//! settings, the services carrying the test-pool flag, and any pending
//! rollout request.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::k8s::{ResourceKind, ResourceRef};
use crate::{Error, Result};

/// A deployment generation, written `v<int>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubsetVersion(u32);

impl SubsetVersion {
    pub fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn number(&self) -> u32 {
        self.0
    }

    /// `<base>-<version>`, the name of this subset's copy of a resource.
    pub fn resource_name(&self, base: &str) -> String {
        format!("{}-{}", base, self)
    }
}

impl fmt::Display for SubsetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for SubsetVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.strip_prefix('v')
            .and_then(|n| n.parse().ok())
            .map(SubsetVersion)
            .ok_or_else(|| Error::logical(format!("invalid subset version '{}' (expected v<int>)", s)))
    }
}

impl TryFrom<String> for SubsetVersion {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SubsetVersion> for String {
    fn from(v: SubsetVersion) -> Self {
        v.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    Prod,
    Test,
}

impl Pool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pool::Prod => "prod",
            Pool::Test => "test",
        }
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pool {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prod" => Ok(Pool::Prod),
            "test" => Ok(Pool::Test),
            other => Err(Error::logical(format!("unknown pool '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pools {
    pub prod: SubsetVersion,
    pub test: SubsetVersion,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubsetRecord {
    /// Config branch; derived from the environment name when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(flatten)]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

/// Work queued for `wait-rollout`. `jobs` and `services` hold resource
/// names (`migrate-v3`, `web-v3`); `versions` is keyed by the bare service
/// (`web`) and rides along with that service's deployment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RolloutRequest {
    #[serde(default)]
    pub jobs: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    /// Target image tag per service.
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
}

impl RolloutRequest {
    /// Nothing left to wait on. A tag in `versions` with no queued
    /// deployment is not a target.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.services.is_empty()
    }

    /// Drop the tag recorded for a deployment, whether keyed by its full
    /// name or by the service it is a subset copy of.
    fn forget_version(&mut self, deployment: &str) -> bool {
        let service = deployment
            .rsplit_once('-')
            .filter(|(_, version)| version.parse::<SubsetVersion>().is_ok())
            .map(|(service, _)| service);
        let before = self.versions.len();
        self.versions
            .retain(|key, _| key != deployment && Some(key.as_str()) != service);
        self.versions.len() != before
    }

    pub fn targets(&self) -> Vec<ResourceRef> {
        self.jobs
            .iter()
            .map(|name| ResourceRef::new(ResourceKind::Job, name.as_str()))
            .chain(
                self.services
                    .iter()
                    .map(|name| ResourceRef::new(ResourceKind::Deployment, name.as_str())),
            )
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub pools: Pools,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub subsets: BTreeMap<SubsetVersion, SubsetRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<RolloutRequest>,
}

impl Environment {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn pool(&self, pool: Pool) -> SubsetVersion {
        match pool {
            Pool::Prod => self.pools.prod,
            Pool::Test => self.pools.test,
        }
    }

    pub fn set_pool(&mut self, pool: Pool, version: SubsetVersion) {
        match pool {
            Pool::Prod => self.pools.prod = version,
            Pool::Test => self.pools.test = version,
        }
    }

    pub fn swap_pools(&mut self) {
        std::mem::swap(&mut self.pools.prod, &mut self.pools.test);
    }

    /// Pools currently bound to `version`.
    pub fn pools_for(&self, version: SubsetVersion) -> Vec<Pool> {
        [Pool::Prod, Pool::Test]
            .into_iter()
            .filter(|pool| self.pool(*pool) == version)
            .collect()
    }

    pub fn is_serving(&self, version: SubsetVersion) -> bool {
        !self.pools_for(version).is_empty()
    }

    pub fn subset(&self, version: SubsetVersion) -> Result<&SubsetRecord> {
        self.subsets
            .get(&version)
            .ok_or_else(|| Error::logical(format!("subset {} is not defined in the environment", version)))
    }

    /// Remove one finished rollout entry. Returns whether anything changed.
    /// An emptied request is dropped.
    pub fn dequeue(&mut self, target: &ResourceRef) -> bool {
        let Some(request) = self.rollout.as_mut() else {
            return false;
        };
        let mut changed = match target.kind {
            ResourceKind::Job => remove_name(&mut request.jobs, &target.name),
            ResourceKind::Deployment => remove_name(&mut request.services, &target.name),
            _ => return false,
        };
        if target.kind == ResourceKind::Deployment {
            changed |= request.forget_version(&target.name);
        }
        if request.is_empty() {
            self.rollout = None;
        }
        changed
    }
}

fn remove_name(queue: &mut Vec<String>, name: &str) -> bool {
    let before = queue.len();
    queue.retain(|queued| queued != name);
    queue.len() != before
}
