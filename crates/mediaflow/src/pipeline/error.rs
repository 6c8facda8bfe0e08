use thiserror::Error;

use crate::db::DatabaseError;
use crate::job::Stage;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// The run's guard or in-flight marker now belongs to someone else.
    #[error("Run {token} of job {job_id} no longer holds the job")]
    StaleRun { job_id: String, token: String },

    #[error("Stage '{stage}' failed for job {job_id}: {reason}")]
    StageFailed {
        job_id: String,
        stage: Stage,
        reason: String,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl PipelineError {
    /// Whether the delivery that produced this error should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Database(_))
    }
}
