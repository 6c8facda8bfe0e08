use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Job not found: {job_id}")]
    NotFound { job_id: String },

    /// No media and no transcript. Not retryable without new input.
    #[error("Nothing to process for job {job_id}: no media and no transcript")]
    NothingToProcess { job_id: String },

    /// The dispatched component failed to start. The job is in `error`.
    #[error("Dispatch failed for job {job_id}: {reason}")]
    DispatchFailed { job_id: String, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
