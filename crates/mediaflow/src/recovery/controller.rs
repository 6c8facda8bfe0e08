//! Recovery controller: picks the single next action for a job and starts it.
//!
//! The controller holds no lock of its own. Concurrent calls for the same
//! job collapse inside the dispatched component: the stage runner guard for
//! runs, the provider submission guard and `provider_job` for transcription.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use super::error::RecoveryError;
use crate::db::{job_repo, Database};
use crate::job::{JobStatus, ProcessingJob, Stage};
use crate::pipeline::StageRunner;
use crate::transcription::{SubmitOutcome, TranscriptionGateway};

/// Next action for a job. Rows are checked in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    AlreadyComplete,
    StartTranscription,
    ResumeAnalysis { skip: Vec<Stage> },
    FullReprocess,
    NothingToProcess,
}

/// Classifies a job. First matching row wins.
pub fn decide(job: &ProcessingJob) -> Decision {
    if job.status == JobStatus::Ready && job.has_transcript() {
        return Decision::AlreadyComplete;
    }
    if job.has_media() && job.kind.requires_transcription() && !job.has_transcript() {
        return Decision::StartTranscription;
    }
    if job.has_transcript() && job.status != JobStatus::Ready {
        let mut skip = vec![Stage::Transcription];
        for stage in &job.progress.completed_stages {
            if !skip.contains(stage) {
                skip.push(*stage);
            }
        }
        return Decision::ResumeAnalysis { skip };
    }
    if job.has_media() {
        return Decision::FullReprocess;
    }
    Decision::NothingToProcess
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    None,
    TranscriptionStarted,
    AnalysisResumed,
    FullReprocessStarted,
}

/// What `decide_and_act` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub action_taken: ActionTaken,
    pub resulting_status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_detail: Option<String>,
    /// The action was already under way; this call started nothing new.
    pub already_in_flight: bool,
}

pub struct RecoveryController {
    db: Database,
    gateway: Arc<TranscriptionGateway>,
    runner: Arc<StageRunner>,
}

impl RecoveryController {
    pub fn new(db: Database, gateway: Arc<TranscriptionGateway>, runner: Arc<StageRunner>) -> Self {
        Self {
            db,
            gateway,
            runner,
        }
    }

    pub async fn decide_and_act(&self, job_id: &str) -> Result<Outcome, RecoveryError> {
        let span = info_span!("recovery", job_id = %job_id);
        self.decide_and_act_inner(job_id).instrument(span).await
    }

    async fn decide_and_act_inner(&self, job_id: &str) -> Result<Outcome, RecoveryError> {
        let job = self.load(job_id)?;
        let decision = decide(&job);
        info!(decision = ?decision, status = %job.status, "Recovery decision");

        let (action_taken, already_in_flight) = match decision {
            Decision::AlreadyComplete => {
                return Ok(Outcome {
                    action_taken: ActionTaken::None,
                    resulting_status: job.status,
                    status_detail: Some("Already complete".to_string()),
                    already_in_flight: false,
                })
            }
            Decision::NothingToProcess => {
                return Err(RecoveryError::NothingToProcess {
                    job_id: job_id.to_string(),
                })
            }
            Decision::StartTranscription => {
                let outcome = self
                    .gateway
                    .submit(&job)
                    .await
                    .map_err(|e| self.dispatch_failed(job_id, e.to_string(), false))?;
                let in_flight = !matches!(outcome, SubmitOutcome::Submitted(_));
                (ActionTaken::TranscriptionStarted, in_flight)
            }
            Decision::ResumeAnalysis { skip } => {
                let handle = self
                    .runner
                    .run(&job, Stage::Analysis, &skip)
                    .map_err(|e| self.dispatch_failed(job_id, e.to_string(), true))?;
                (ActionTaken::AnalysisResumed, !handle.started())
            }
            Decision::FullReprocess => {
                let handle = self
                    .runner
                    .rerun(&job)
                    .map_err(|e| self.dispatch_failed(job_id, e.to_string(), true))?;
                (ActionTaken::FullReprocessStarted, !handle.started())
            }
        };

        let current = self.load(job_id)?;
        Ok(Outcome {
            action_taken,
            resulting_status: current.status,
            status_detail: current.progress.status_detail,
            already_in_flight,
        })
    }

    fn load(&self, job_id: &str) -> Result<ProcessingJob, RecoveryError> {
        self.db
            .with_conn(|conn| job_repo::find_by_id(conn, job_id))?
            .ok_or_else(|| RecoveryError::NotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Builds the `DispatchFailed` error, recording the cause on the job
    /// when the failing component has not already done so.
    fn dispatch_failed(&self, job_id: &str, reason: String, record: bool) -> RecoveryError {
        warn!(job_id = %job_id, error = %reason, "Dispatch failed");
        if record {
            let error = format!("Dispatch failed: {}", reason);
            if let Err(e) = self
                .db
                .with_conn(|conn| job_repo::mark_error(conn, job_id, &error))
            {
                warn!(job_id = %job_id, "Failed to record dispatch failure: {}", e);
            }
        }
        RecoveryError::DispatchFailed {
            job_id: job_id.to_string(),
            reason,
        }
    }
}
