// src/errors.rs

//! Crate-wide error type and result alias.
//!
//! Fatal conditions (planning, initialization, submission, internal
//! consistency, cancellation) propagate to the caller and stop the run.
//! `TaskExecution` is the only recoverable variant: the scheduler absorbs it
//! through the retry policy and it never escapes `wait_for_completion`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskfleetError {
    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Backend initialization error: {0}")]
    Initialization(String),

    #[error("Submission error: {0}")]
    Submission(String),

    #[error("Task '{task}' failed: {message}")]
    TaskExecution { task: String, message: String },

    #[error("Internal consistency error: {0}")]
    InternalConsistency(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskfleetError {
    /// Convenience constructor for a failed task attempt.
    pub fn task(task: impl Into<String>, message: impl Into<String>) -> Self {
        TaskfleetError::TaskExecution {
            task: task.into(),
            message: message.into(),
        }
    }

    /// Whether this error should stop the whole run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TaskfleetError::TaskExecution { .. })
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TaskfleetError>;
