//! Worker-side execution of a stage run.
//!
//! Every write the executor makes is conditional on the job's in-flight
//! marker still equal to the run token, and the guard is checked before
//! the run starts and renewed after each analysis step. A run whose lease
//! expired and was taken over finds its writes rejected and stops with
//! [`PipelineError::StaleRun`] without touching the newer run's state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};

use super::analysis::{AnalysisEngine, AnalysisRequest};
use super::error::PipelineError;
use super::progress::{ProgressEvent, ProgressReporter};
use super::trigger::{plan_stages, StageTrigger};
use crate::db::{guard_repo, job_repo, now_ms, queue_repo, Database};
use crate::guard;
use crate::job::{ProcessingJob, Stage};
use crate::sanitize::truncate;
use crate::transcription::{SubmitOutcome, TranscriptionGateway};

const MAX_ERROR_LENGTH: usize = 500;

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every planned stage finished and the job is `ready`.
    Completed,
    /// Handed over to the transcription provider. The callback or a poll
    /// dispatches the next run.
    AwaitingTranscript,
}

/// Identifies the queue row a run was delivered by, so its visibility
/// lease can be extended alongside the guard.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryLease {
    pub delivery_id: i64,
    pub lease: Duration,
}

pub struct StageExecutor {
    db: Database,
    gateway: Arc<TranscriptionGateway>,
    engine: Arc<dyn AnalysisEngine>,
}

enum Handoff {
    Suspended,
    Continue(ProcessingJob),
}

impl StageExecutor {
    pub fn new(
        db: Database,
        gateway: Arc<TranscriptionGateway>,
        engine: Arc<dyn AnalysisEngine>,
    ) -> Self {
        Self { db, gateway, engine }
    }

    pub async fn execute(
        &self,
        trigger: &StageTrigger,
        delivery: Option<DeliveryLease>,
        progress: &dyn ProgressReporter,
    ) -> Result<RunOutcome, PipelineError> {
        let span = info_span!(
            "stage_run",
            job_id = %trigger.job_id,
            run_token = %trigger.run_token,
            resume_from = %trigger.resume_from,
            rerun = trigger.rerun,
        );
        self.execute_inner(trigger, delivery, progress)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        trigger: &StageTrigger,
        delivery: Option<DeliveryLease>,
        progress: &dyn ProgressReporter,
    ) -> Result<RunOutcome, PipelineError> {
        let mut job = self.verify(trigger)?;
        let stages = plan_stages(&job, trigger.resume_from, &trigger.skip_stages, trigger.rerun);
        debug!(?stages, "Executing stage run");

        for stage in stages {
            progress.report(ProgressEvent::Stage {
                stage,
                message: stage.start_detail().to_string(),
            });
            let result = match stage {
                Stage::Transcription => match self
                    .transcription_stage(trigger, &job)
                    .instrument(info_span!("transcription"))
                    .await
                {
                    Ok(Handoff::Suspended) => {
                        progress.report(ProgressEvent::AwaitingTranscript);
                        return Ok(RunOutcome::AwaitingTranscript);
                    }
                    Ok(Handoff::Continue(next)) => {
                        job = next;
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                Stage::Analysis => {
                    self.analysis_stage(trigger, &job, delivery, progress)
                        .instrument(info_span!("analysis"))
                        .await
                }
            };

            if let Err(e) = result {
                return Err(self.fail(trigger, stage, e, progress));
            }
        }

        let finished = self.db.with_tx(|conn| {
            let finished =
                job_repo::finish_run(conn, &trigger.job_id, &trigger.run_token, "Processing complete")?;
            if finished {
                guard_repo::release(conn, &trigger.idempotency_key, &trigger.run_token)?;
            }
            Ok(finished)
        })?;
        if !finished {
            return Err(self.stale(trigger));
        }

        info!(job_id = %trigger.job_id, "Stage run complete");
        progress.report(ProgressEvent::Completed);
        Ok(RunOutcome::Completed)
    }

    fn load(&self, job_id: &str) -> Result<ProcessingJob, PipelineError> {
        self.db
            .with_conn(|conn| job_repo::find_by_id(conn, job_id))?
            .ok_or_else(|| PipelineError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Confirms the trigger still owns the job: guard live with our token
    /// and the job's marker set to it.
    fn verify(&self, trigger: &StageTrigger) -> Result<ProcessingJob, PipelineError> {
        let (job, current) = self.db.with_conn(|conn| {
            let job = job_repo::find_by_id(conn, &trigger.job_id)?;
            let current =
                guard::is_current_in(conn, &trigger.idempotency_key, &trigger.run_token)?;
            Ok((job, current))
        })?;
        let job = job.ok_or_else(|| PipelineError::JobNotFound {
            job_id: trigger.job_id.clone(),
        })?;
        let owns_marker =
            job.progress.in_flight_marker.as_deref() == Some(trigger.run_token.as_str());
        if !current || !owns_marker {
            return Err(self.stale(trigger));
        }
        Ok(job)
    }

    fn stale(&self, trigger: &StageTrigger) -> PipelineError {
        warn!(
            job_id = %trigger.job_id,
            run_token = %trigger.run_token,
            "Run no longer holds the job; discarding"
        );
        PipelineError::StaleRun {
            job_id: trigger.job_id.clone(),
            token: trigger.run_token.clone(),
        }
    }

    async fn transcription_stage(
        &self,
        trigger: &StageTrigger,
        job: &ProcessingJob,
    ) -> Result<Handoff, PipelineError> {
        if job.has_transcript() && !trigger.rerun {
            let recorded = self.db.with_conn(|conn| {
                job_repo::record_stage_complete(
                    conn,
                    &job.id,
                    &trigger.run_token,
                    Stage::Transcription,
                    "Transcript available",
                )
            })?;
            if !recorded {
                return Err(self.stale(trigger));
            }
            return Ok(Handoff::Continue(self.load(&job.id)?));
        }

        let outcome = self.gateway.submit(job).await.map_err(|e| {
            PipelineError::StageFailed {
                job_id: job.id.clone(),
                stage: Stage::Transcription,
                reason: e.to_string(),
            }
        })?;
        match &outcome {
            SubmitOutcome::Submitted(provider_job) => {
                info!(external_id = %provider_job.external_id, "Transcription submitted")
            }
            SubmitOutcome::AlreadyOutstanding(provider_job) => {
                info!(external_id = %provider_job.external_id, "Transcription already outstanding")
            }
            SubmitOutcome::InProgress => debug!("Submission in progress elsewhere"),
        }

        // Suspend unless the provider already answered; a completion that
        // raced ahead of us found the guard held and could not dispatch.
        let handoff = self.db.with_tx(|conn| {
            let Some(current) = job_repo::find_by_id(conn, &job.id)? else {
                return Ok(None);
            };
            if current.has_transcript() && current.progress.provider_job.is_none() {
                let recorded = job_repo::record_stage_complete(
                    conn,
                    &job.id,
                    &trigger.run_token,
                    Stage::Transcription,
                    "Transcription complete",
                )?;
                return Ok(recorded.then_some(Handoff::Continue(current)));
            }
            if !job_repo::suspend_run(conn, &job.id, &trigger.run_token)? {
                return Ok(None);
            }
            guard_repo::release(conn, &trigger.idempotency_key, &trigger.run_token)?;
            Ok(Some(Handoff::Suspended))
        })?;

        match handoff {
            Some(Handoff::Suspended) => {
                info!("Awaiting transcript from provider");
                Ok(Handoff::Suspended)
            }
            Some(handoff) => Ok(handoff),
            None => Err(self.stale(trigger)),
        }
    }

    async fn analysis_stage(
        &self,
        trigger: &StageTrigger,
        job: &ProcessingJob,
        delivery: Option<DeliveryLease>,
        progress: &dyn ProgressReporter,
    ) -> Result<(), PipelineError> {
        let Some(transcript) = job.transcript_text.as_deref() else {
            return Err(PipelineError::StageFailed {
                job_id: job.id.clone(),
                stage: Stage::Analysis,
                reason: "No transcript available for analysis".to_string(),
            });
        };
        let language_code = job
            .transcript_structured
            .as_ref()
            .and_then(|t| t.language_code.as_deref());

        let mut checkpoint = job.progress.analysis_checkpoint.clone();
        for step in crate::job::AnalysisStep::ALL {
            if checkpoint.contains(&step) {
                debug!(step = %step, "Step already checkpointed");
                continue;
            }
            let step_span = info_span!("analysis_step", step = %step);
            progress.report(ProgressEvent::Step { step });

            self.heartbeat(trigger, delivery)?;

            let report = self
                .engine
                .run_step(&AnalysisRequest {
                    job_id: &job.id,
                    step,
                    transcript,
                    language_code,
                })
                .instrument(step_span)
                .await
                .map_err(|e| PipelineError::StageFailed {
                    job_id: job.id.clone(),
                    stage: Stage::Analysis,
                    reason: format!("{} step failed: {}", step, e),
                })?;
            debug!(step = %step, items = report.items, "Analysis step finished");

            checkpoint.push(step);
            let recorded = self.db.with_conn(|conn| {
                job_repo::record_analysis_step(
                    conn,
                    &job.id,
                    &trigger.run_token,
                    &checkpoint,
                    step.detail(),
                )
            })?;
            if !recorded {
                return Err(self.stale(trigger));
            }
        }

        let recorded = self.db.with_conn(|conn| {
            job_repo::record_stage_complete(
                conn,
                &job.id,
                &trigger.run_token,
                Stage::Analysis,
                "Analysis complete",
            )
        })?;
        if !recorded {
            return Err(self.stale(trigger));
        }
        Ok(())
    }

    /// Extends the run's guard and, when delivered from the queue, the
    /// delivery's visibility lease.
    fn heartbeat(
        &self,
        trigger: &StageTrigger,
        delivery: Option<DeliveryLease>,
    ) -> Result<(), PipelineError> {
        let ttl_ms = i64::try_from(trigger.idempotency_ttl_secs.saturating_mul(1000))
            .unwrap_or(i64::MAX);
        let renewed = self.db.with_tx(|conn| {
            let now = now_ms();
            let renewed =
                guard_repo::renew(conn, &trigger.idempotency_key, &trigger.run_token, now, ttl_ms)?;
            if renewed {
                if let Some(delivery) = delivery {
                    let lease_ms = i64::try_from(delivery.lease.as_millis()).unwrap_or(i64::MAX);
                    queue_repo::extend(conn, delivery.delivery_id, now, lease_ms)?;
                }
            }
            Ok(renewed)
        })?;
        if renewed {
            Ok(())
        } else {
            Err(self.stale(trigger))
        }
    }

    /// Records a stage failure on the job and frees the guard.
    fn fail(
        &self,
        trigger: &StageTrigger,
        stage: Stage,
        error: PipelineError,
        progress: &dyn ProgressReporter,
    ) -> PipelineError {
        // Stale runs leave the job alone; database errors keep the guard so
        // the redelivered trigger can carry on.
        if matches!(
            error,
            PipelineError::StaleRun { .. } | PipelineError::Database(_)
        ) {
            return error;
        }
        let message = truncate(&error.to_string(), MAX_ERROR_LENGTH);
        let recorded = self.db.with_tx(|conn| {
            let failed = job_repo::fail_run(conn, &trigger.job_id, &trigger.run_token, &message)?;
            guard_repo::release(conn, &trigger.idempotency_key, &trigger.run_token)?;
            Ok(failed)
        });
        match recorded {
            Ok(true) => {
                warn!(job_id = %trigger.job_id, stage = %stage, error = %message, "Stage failed");
                progress.report(ProgressEvent::Failed { error: message });
                match error {
                    PipelineError::StageFailed { .. } => error,
                    other => PipelineError::StageFailed {
                        job_id: trigger.job_id.clone(),
                        stage,
                        reason: other.to_string(),
                    },
                }
            }
            Ok(false) => self.stale(trigger),
            Err(db_error) => {
                warn!(job_id = %trigger.job_id, "Failed to record stage failure: {}", db_error);
                PipelineError::Database(db_error)
            }
        }
    }
}
