//! Stage runner dispatch.
//!
//! A dispatch acquires the job's stage runner guard, stamps the job with the
//! new run token and enqueues a [`StageTrigger`], all in one transaction.
//! Either all three happen or none does, so a crash can never leave a
//! claimed job without a queued trigger.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info};

use super::error::PipelineError;
use super::trigger::{plan_stages, RunHandle, StageTrigger};
use crate::db::{job_repo, now_ms, queue_repo, Database, DatabaseError};
use crate::guard::{self, stage_runner_key, Acquire};
use crate::job::{JobStatus, ProcessingJob, Stage};

enum Dispatch {
    Missing,
    Handle(RunHandle),
}

pub struct StageRunner {
    db: Database,
    run_ttl: Duration,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl StageRunner {
    pub fn new(db: Database, run_ttl: Duration) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            db,
            run_ttl,
            wake_tx,
            wake_rx,
        }
    }

    pub fn run_ttl(&self) -> Duration {
        self.run_ttl
    }

    /// Signalled after every enqueue so idle workers pick the trigger up
    /// without waiting for their poll interval.
    pub fn wake_receiver(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }

    /// Runs the job's pending stages starting at `resume_from`.
    pub fn run(
        &self,
        job: &ProcessingJob,
        resume_from: Stage,
        skip_stages: &[Stage],
    ) -> Result<RunHandle, PipelineError> {
        self.dispatch(&job.id, resume_from, skip_stages, false)
    }

    /// Re-executes every stage the job's kind requires, completed or not.
    pub fn rerun(&self, job: &ProcessingJob) -> Result<RunHandle, PipelineError> {
        let first = job
            .kind
            .required_stages()
            .first()
            .copied()
            .unwrap_or(Stage::Transcription);
        self.dispatch(&job.id, first, &[], true)
    }

    fn dispatch(
        &self,
        job_id: &str,
        resume_from: Stage,
        skip_stages: &[Stage],
        rerun: bool,
    ) -> Result<RunHandle, PipelineError> {
        let key = stage_runner_key(job_id);
        let ttl = self.run_ttl;

        let dispatch = self.db.with_tx(|conn| {
            let Some(job) = job_repo::find_by_id(conn, job_id)? else {
                return Ok(Dispatch::Missing);
            };
            let stages = plan_stages(&job, resume_from, skip_stages, rerun);
            if stages.is_empty() && job.status == JobStatus::Ready {
                return Ok(Dispatch::Handle(RunHandle::UpToDate));
            }

            let lease = match guard::acquire_in(conn, &key, ttl)? {
                Acquire::Acquired(lease) => lease,
                Acquire::Held { token } => {
                    return Ok(Dispatch::Handle(RunHandle::AlreadyRunning { token }))
                }
            };

            let first = stages.first().copied().unwrap_or(resume_from);
            job_repo::claim_run(conn, job_id, &lease.token, first, first.start_detail(), rerun)?;

            let trigger = StageTrigger {
                job_id: job_id.to_string(),
                resume_from,
                skip_stages: skip_stages.to_vec(),
                idempotency_key: lease.key.clone(),
                idempotency_ttl_secs: ttl.as_secs(),
                run_token: lease.token.clone(),
                rerun,
            };
            let payload = trigger.to_payload().map_err(|e| DatabaseError::Json {
                column: "payload",
                source: e,
            })?;
            queue_repo::push(conn, job_id, &lease.token, &payload, now_ms())?;

            Ok(Dispatch::Handle(RunHandle::Started { token: lease.token }))
        })?;

        match dispatch {
            Dispatch::Missing => Err(PipelineError::JobNotFound {
                job_id: job_id.to_string(),
            }),
            Dispatch::Handle(handle) => {
                match &handle {
                    RunHandle::Started { token } => {
                        info!(
                            job_id = %job_id,
                            run_token = %token,
                            resume_from = %resume_from,
                            rerun,
                            "Stage run dispatched"
                        );
                        let _ = self.wake_tx.try_send(());
                    }
                    RunHandle::AlreadyRunning { token } => {
                        debug!(job_id = %job_id, run_token = %token, "Stage run already in flight");
                    }
                    RunHandle::UpToDate => {
                        debug!(job_id = %job_id, "All stages complete, nothing dispatched");
                    }
                }
                Ok(handle)
            }
        }
    }
}
