// crates/jobs/src/error.rs
use thiserror::Error;

/// Errors returned synchronously by the scheduler's producer API.
///
/// Unit-of-work failures never surface here; they become `failed` job records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl JobError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// Result type alias for scheduler operations.
pub type JobResult<T> = Result<T, JobError>;
