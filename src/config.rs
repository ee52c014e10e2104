use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub swap: SwapConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    pub lock_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// kubectl binary; looked up on PATH when unset.
    pub kubectl: Option<String>,
    pub namespace: String,
    pub context: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl: None,
            namespace: "default".to_string(),
            context: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Working copy of the config repository.
    pub path: Option<String>,
    pub remote: String,
    pub root_branch: String,
    pub environment: String,
    pub author_name: String,
    pub author_email: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: None,
            remote: "origin".to_string(),
            root_branch: "main".to_string(),
            environment: "production".to_string(),
            author_name: "poolshift".to_string(),
            author_email: "poolshift@localhost".to_string(),
        }
    }
}

impl RepoConfig {
    /// Branch name of a subset's configuration lineage.
    pub fn subset_branch(&self, version: &str) -> String {
        format!("{}-{}", self.environment, version)
    }

    /// Relative path of the environment file inside the repository.
    pub fn environment_file(&self) -> PathBuf {
        Path::new("environments").join(format!("{}.yaml", self.environment))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub rest_millis: u64,
    pub timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            rest_millis: 5_000,
            timeout_secs: 600,
        }
    }
}

impl PollingConfig {
    pub fn rest(&self) -> Duration {
        Duration::from_millis(self.rest_millis)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    pub attempts: u32,
    pub attempt_timeout_millis: u64,
    pub interval_millis: u64,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout_millis: 180_000,
            interval_millis: 15_000,
        }
    }
}

impl SwapConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_millis)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub service_label: String,
    pub subset_label: String,
    /// Command run in each pod; prints the live settings as JSON.
    pub flag_probe: Vec<String>,
    /// Dotted path of the test-pool flag in the probe output.
    pub flag_field: String,
    /// Service every subset runs and whose liveness gates a swap.
    pub liveness_service: String,
    pub liveness_probe: Vec<String>,
    pub exec_timeout_secs: u64,
    /// Upper bound on concurrent cluster writes during spin-down/spin-up.
    pub chunk_size: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            service_label: "app".to_string(),
            subset_label: "subset".to_string(),
            flag_probe: vec![
                "curl".to_string(),
                "-sf".to_string(),
                "http://localhost:8080/settings".to_string(),
            ],
            flag_field: "testPool".to_string(),
            liveness_service: "internal".to_string(),
            liveness_probe: vec![
                "curl".to_string(),
                "-sf".to_string(),
                "http://localhost:8080/healthz".to_string(),
            ],
            exec_timeout_secs: 60,
            chunk_size: 4,
        }
    }
}

impl FleetConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    /// Label selector for the pods of one service in one subset.
    pub fn selector(&self, service: &str, version: &str) -> String {
        format!(
            "{}={},{}={}",
            self.service_label, service, self.subset_label, version
        )
    }
}

impl Config {
    pub fn poolshift_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".poolshift"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::poolshift_dir()?.join("poolshift.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::poolshift_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        fs::write(Self::config_path()?, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn repo_path(&self) -> Result<PathBuf> {
        match &self.repo.path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(std::env::current_dir()?),
        }
    }

    pub fn lock_path(&self) -> Result<PathBuf> {
        match &self.lock_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::poolshift_dir()?.join("poolshift.lock")),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
