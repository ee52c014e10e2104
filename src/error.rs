use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    /// Precondition or user-input violation. Reported, never retried.
    #[error("{0}")]
    Logical(String),

    #[error("Timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// Outcome of a batch that did not fully succeed; `succeeded` names what went through.
    #[error("{} of {} operations failed: {}", .failures.len(), .failures.len() + .succeeded.len(), summarize(.failures))]
    Aggregate {
        succeeded: Vec<String>,
        failures: Vec<Error>,
    },

    #[error("Git conflict: {0}")]
    GitConflict(String),

    #[error("Push rejected (non-fast-forward): {0}")]
    NonFastForward(String),

    #[error("{context}: {message}")]
    Transport { context: String, message: String },

    #[error("Another poolshift invocation holds the lock at {0}")]
    Locked(String),

    #[error("Tool not available: {0}")]
    ToolNotAvailable(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    pub fn logical(msg: impl Into<String>) -> Self {
        Error::Logical(msg.into())
    }

    /// Wrap a lower-level failure with the resource it concerned.
    pub fn transport(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::Transport {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

fn summarize(failures: &[Error]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;
