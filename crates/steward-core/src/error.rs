//! Error taxonomy shared by every Steward crate.

use std::fmt::Display;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, StewardError>;

#[derive(Debug, thiserror::Error)]
pub enum StewardError {
    /// Input rejected before anything was persisted (bad cron, duplicate id, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// A task, run or other record referenced by id does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The prompt executor failed while running a task.
    #[error("execution error: {0}")]
    Execution(String),

    /// The embedded store is unreachable or corrupted.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StewardError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn storage(err: impl Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn execution(err: impl Display) -> Self {
        Self::Execution(err.to_string())
    }

    /// True for errors that mean storage can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }
}
