use std::path::PathBuf;

use thiserror::Error;

/// Everything the task core can report. Subprocess failures are not in
/// here: a failing download is recorded in the task log, not returned.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid task name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("task {name} already exists")]
    AlreadyExists { name: String },

    #[error("task {name} not found")]
    NotFound { name: String },

    #[error("task {name} is already running; try again later")]
    AlreadyRunning { name: String },

    #[error("task {name} has an unreadable record: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TaskError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Caller-correctable input problems, rejected before any mutation.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::InvalidName { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
