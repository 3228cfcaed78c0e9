//! Error taxonomy for submissions, pipelines and the job registry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobId;

/// Result type used throughout the library.
pub type JobResult<T> = Result<T, JobError>;

/// Errors raised by the manager and by conversion pipelines.
///
/// Per-job variants (`Decode`, `Mux`, `Timeout`, `InternalInvariantViolation`)
/// are recorded on the owning job and never escape the pipeline boundary.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Video encoding failed: {message}")]
    Mux {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("Job exceeded its time budget of {0} seconds")]
    Timeout(u64),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Internal invariant violated: {0}")]
    InternalInvariantViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl JobError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn mux(msg: impl Into<String>) -> Self {
        Self::Mux {
            message: msg.into(),
            stderr: None,
            exit_code: None,
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InternalInvariantViolation(msg.into())
    }

    /// Classification reported through job snapshots.
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::InvalidParameters(_) => ErrorKind::InvalidParameters,
            JobError::NotFound(_) => ErrorKind::NotFound,
            JobError::Decode(_) => ErrorKind::DecodeError,
            JobError::Mux { .. } => ErrorKind::MuxError,
            JobError::Timeout(_) => ErrorKind::Timeout,
            JobError::Cancelled => ErrorKind::Cancelled,
            JobError::InternalInvariantViolation(_) | JobError::Io(_) | JobError::Image(_) => {
                ErrorKind::InternalInvariantViolation
            }
        }
    }
}

/// Serializable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParameters,
    NotFound,
    DecodeError,
    MuxError,
    Timeout,
    Cancelled,
    InternalInvariantViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParameters => "invalid_parameters",
            ErrorKind::NotFound => "not_found",
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::MuxError => "mux_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InternalInvariantViolation => "internal_invariant_violation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure recorded on a job: the classification plus a short description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&JobError> for JobFailure {
    fn from(err: &JobError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
