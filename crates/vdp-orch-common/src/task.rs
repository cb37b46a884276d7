//! Outcome of processing one queued message.

use thiserror::Error;

/// Result of processing a single queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Message processed successfully
    Success,
    /// Message failed and will not be retried
    Failed,
    /// Message failed and must be parked for a later retry
    NeedRetry,
    /// Message had nothing to do (already applied, etc.)
    Ignore,
}

impl TaskStatus {
    /// Returns true if the message completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Ignore)
    }

    /// Returns true if the message should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::NeedRetry)
    }
}

/// Error type for message processing failures.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// Message failed, no retry
    #[error("Failed: {message}")]
    Failed { message: String },

    /// Message should be retried later
    #[error("Retry needed: {reason}")]
    NeedRetry { reason: String },

    /// Message was ignored
    #[error("Ignored: {reason}")]
    Ignored { reason: String },
}

impl TaskError {
    /// Creates a permanent failure.
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed {
            message: message.into(),
        }
    }

    /// Creates a retry error.
    pub fn need_retry(reason: impl Into<String>) -> Self {
        TaskError::NeedRetry {
            reason: reason.into(),
        }
    }

    /// Creates an ignored error.
    pub fn ignored(reason: impl Into<String>) -> Self {
        TaskError::Ignored {
            reason: reason.into(),
        }
    }

    /// Converts this error to a TaskStatus.
    pub fn to_status(&self) -> TaskStatus {
        match self {
            TaskError::Failed { .. } => TaskStatus::Failed,
            TaskError::NeedRetry { .. } => TaskStatus::NeedRetry,
            TaskError::Ignored { .. } => TaskStatus::Ignore,
        }
    }
}

/// Result type for message processing.
pub type TaskResult<T> = Result<T, TaskError>;

/// Extension trait for converting TaskResult to TaskStatus.
pub trait TaskResultExt {
    /// Converts this result to a TaskStatus.
    fn to_status(&self) -> TaskStatus;
}

impl<T> TaskResultExt for TaskResult<T> {
    fn to_status(&self) -> TaskStatus {
        match self {
            Ok(_) => TaskStatus::Success,
            Err(e) => e.to_status(),
        }
    }
}
