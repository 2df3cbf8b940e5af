use thiserror::Error;

use crate::database::DbError;
use crate::sheet::{FetchError, OriginMismatch};
use crate::tracker::JobId;

/// Errors surfaced by the tracking engine and its lifecycle layer.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Malformed range text, unsupported interval kind and the like.
    /// Raised before a job is ever scheduled.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Job {0} is already being tracked")]
    DuplicateJob(JobId),

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// A caller handed the diff engine snapshots with different anchors.
    #[error("Invariant violation: {0}")]
    InvariantViolation(#[from] OriginMismatch),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Database(#[from] DbError),
}

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;
