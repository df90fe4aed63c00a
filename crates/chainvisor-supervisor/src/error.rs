use std::path::PathBuf;

use chainvisor_core::{CoordinatorError, SharedError};
use thiserror::Error;

use crate::launcher::RunOutcome;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Every configuration problem found, flattened into one error.
    #[error("invalid configuration: {0}")]
    Config(SharedError),

    #[error("layout error: {0}")]
    Layout(String),

    #[error("failed to launch {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Forwarding the node's output failed. The exit was still resolved, so
    /// `outcome` says whether an upgrade was applied.
    #[error("forwarding node output failed: {error}")]
    Teardown {
        error: SharedError,
        outcome: Box<RunOutcome>,
    },

    #[error("data backup to {} failed: {source}", .dest.display())]
    Backup {
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pre-upgrade for {name} failed: {reason}")]
    PreUpgrade { name: String, reason: String },

    #[error(transparent)]
    Signal(#[from] CoordinatorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// A single configuration problem. Validation collects all of them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigIssue {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{var} must be a boolean, got {value:?}")]
    InvalidBool { var: &'static str, value: String },

    #[error("{var} must be a duration such as 300ms or 2s, got {value:?}")]
    InvalidDuration { var: &'static str, value: String },

    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{0} must be greater than 0")]
    NotPositive(&'static str),

    #[error("{var} must be an absolute path, got {}", .path.display())]
    NotAbsolute { var: &'static str, path: PathBuf },

    #[error("{} is not a directory", .0.display())]
    NotDirectory(PathBuf),
}

impl SupervisorError {
    /// Outcome of the run that failed during teardown, if any.
    pub fn outcome(&self) -> Option<&RunOutcome> {
        match self {
            SupervisorError::Teardown { outcome, .. } => Some(outcome.as_ref()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
