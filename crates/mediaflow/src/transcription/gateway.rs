//! Transcription gateway: submits media to the provider and folds provider
//! results back into the job record.
//!
//! Webhook and poll both end in [`TranscriptionGateway::apply`]. Completion
//! is conditional on the submission still being outstanding, so whichever
//! path arrives first applies the transcript and the other becomes a no-op.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tracing::Instrument;

use super::error::{GatewayError, ProviderError};
use super::provider::{CallbackPayload, ProviderEvent, SubmitRequest, TranscriptionProvider};
use super::signer::MediaUrlSigner;
use crate::db::{job_repo, Database};
use crate::guard::{transcription_key, Acquire, IdempotencyGuard};
use crate::job::{normalize, JobStatus, ProcessingJob, ProviderJob, Stage};
use crate::pipeline::{RunHandle, StageRunner};
use crate::sanitize::{redact_media_ref, redact_url, truncate};

const MAX_ERROR_LENGTH: usize = 500;

const SUBMITTED_DETAIL: &str = "Transcribing audio...";
const COMPLETED_DETAIL: &str = "Transcription complete";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted(ProviderJob),
    /// A submission already exists; nothing was sent.
    AlreadyOutstanding(ProviderJob),
    /// Another caller is submitting right now.
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied {
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        run: Option<RunHandle>,
    },
    /// The result was already applied by the other path.
    AlreadyApplied,
    StillPending {
        external_status: String,
    },
    UnknownJob,
    NothingToPoll,
}

pub struct TranscriptionGateway {
    db: Database,
    guard: IdempotencyGuard,
    provider: Arc<dyn TranscriptionProvider>,
    signer: MediaUrlSigner,
    runner: Arc<StageRunner>,
    webhook_url: Option<String>,
    submit_ttl: Duration,
}

impl TranscriptionGateway {
    pub fn new(
        db: Database,
        provider: Arc<dyn TranscriptionProvider>,
        signer: MediaUrlSigner,
        runner: Arc<StageRunner>,
        webhook_url: Option<String>,
        submit_ttl: Duration,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(db.clone()),
            db,
            provider,
            signer,
            runner,
            webhook_url,
            submit_ttl,
        }
    }

    /// Submits the job's media for transcription, at most once per job.
    pub async fn submit(&self, job: &ProcessingJob) -> Result<SubmitOutcome, GatewayError> {
        if let Some(existing) = &job.progress.provider_job {
            debug!(
                "Job {} already has submission {}",
                job.id, existing.external_id
            );
            return Ok(SubmitOutcome::AlreadyOutstanding(existing.clone()));
        }

        let key = transcription_key(&job.id);
        let lease = match self.guard.acquire(&key, self.submit_ttl)? {
            Acquire::Acquired(lease) => lease,
            Acquire::Held { .. } => return Ok(SubmitOutcome::InProgress),
        };

        let span = tracing::info_span!("transcription_submit", job_id = %job.id);
        let result = self.submit_locked(&job.id).instrument(span).await;

        if let Err(e) = self.guard.release(&lease.key, &lease.token) {
            warn!("Failed to release submission guard for job {}: {}", job.id, e);
        }
        result
    }

    async fn submit_locked(&self, job_id: &str) -> Result<SubmitOutcome, GatewayError> {
        let job = self
            .db
            .with_conn(|conn| job_repo::find_by_id(conn, job_id))?
            .ok_or_else(|| GatewayError::NotFound {
                job_id: job_id.to_string(),
            })?;
        if let Some(existing) = job.progress.provider_job {
            return Ok(SubmitOutcome::AlreadyOutstanding(existing));
        }
        let media_ref = match job.media_ref.as_deref().filter(|m| !m.is_empty()) {
            Some(media_ref) => media_ref,
            None => {
                return Err(GatewayError::MissingMedia {
                    job_id: job_id.to_string(),
                })
            }
        };

        let signed = match self.signer.sign(job_id, media_ref) {
            Ok(signed) => signed,
            Err(e) => {
                self.record_failure(job_id, &format!("Failed to sign media URL: {}", e));
                return Err(e.into());
            }
        };
        info!(
            "Submitting {} for transcription via {}",
            redact_media_ref(media_ref),
            redact_url(&signed.url)
        );

        let request = SubmitRequest {
            audio_url: signed.url,
            webhook_url: self.webhook_url.clone(),
        };
        let submission = match self.provider.submit(&request).await {
            Ok(submission) => submission,
            Err(e) => {
                self.record_failure(job_id, &format!("Transcription submission failed: {}", e));
                return Err(e.into());
            }
        };

        let provider_job = ProviderJob {
            external_id: submission.external_id,
            external_status: Some(submission.status),
            callback_url: self.webhook_url.clone(),
        };
        let recorded = self.db.with_conn(|conn| {
            job_repo::record_submission(conn, job_id, &provider_job, SUBMITTED_DETAIL)
        })?;
        if !recorded {
            warn!(
                "Job {} gained a submission while {} was in flight",
                job_id, provider_job.external_id
            );
        }
        info!(
            "Job {} submitted as {}",
            job_id, provider_job.external_id
        );
        Ok(SubmitOutcome::Submitted(provider_job))
    }

    fn record_failure(&self, job_id: &str, error: &str) {
        let error = truncate(error, MAX_ERROR_LENGTH);
        if let Err(e) = self
            .db
            .with_conn(|conn| job_repo::mark_error(conn, job_id, &error))
        {
            warn!("Failed to record error on job {}: {}", job_id, e);
        }
    }

    /// Handles a provider webhook.
    pub async fn handle_callback(
        &self,
        payload: &CallbackPayload,
    ) -> Result<ApplyOutcome, GatewayError> {
        let job = self
            .db
            .with_conn(|conn| job_repo::find_by_external_id(conn, &payload.external_id))?;
        let Some(job) = job else {
            info!(
                "Callback for unknown transcript {} ignored",
                payload.external_id
            );
            return Ok(ApplyOutcome::UnknownJob);
        };

        let event = match payload.event() {
            Some(event) => event,
            None => self.fetch_event(&payload.external_id).await?,
        };
        self.apply(&job, &payload.external_id, event).await
    }

    /// Queries the provider for a job with an outstanding submission.
    pub async fn poll(&self, job_id: &str) -> Result<ApplyOutcome, GatewayError> {
        let job = self
            .db
            .with_conn(|conn| job_repo::find_by_id(conn, job_id))?
            .ok_or_else(|| GatewayError::NotFound {
                job_id: job_id.to_string(),
            })?;
        let Some(provider_job) = job.progress.provider_job.clone() else {
            return Ok(ApplyOutcome::NothingToPoll);
        };

        let event = self.fetch_event(&provider_job.external_id).await?;
        self.apply(&job, &provider_job.external_id, event).await
    }

    /// Fetches the transcript document. A terminal rejection (unknown id,
    /// 4xx) means the submission is gone and is reported as a failure event;
    /// transient errors propagate and leave the job untouched.
    async fn fetch_event(&self, external_id: &str) -> Result<ProviderEvent, GatewayError> {
        match self.provider.fetch(external_id).await {
            Ok(document) => Ok(ProviderEvent::from_document(document)),
            Err(ProviderError::Terminal { message }) => {
                warn!("Transcript {} rejected by provider: {}", external_id, message);
                Ok(ProviderEvent::Failed { message })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Applies one provider event to the job that owns `external_id`.
    pub async fn apply(
        &self,
        job: &ProcessingJob,
        external_id: &str,
        event: ProviderEvent,
    ) -> Result<ApplyOutcome, GatewayError> {
        match event {
            ProviderEvent::Pending { external_status } => {
                self.db.with_conn(|conn| {
                    job_repo::update_external_status(conn, &job.id, external_id, &external_status)
                })?;
                debug!("Transcript {} still {}", external_id, external_status);
                Ok(ApplyOutcome::StillPending { external_status })
            }
            ProviderEvent::Failed { message } => self.apply_failure(job, external_id, &message),
            ProviderEvent::Completed { raw } => {
                let Some(transcript) = normalize(&raw) else {
                    return self.apply_failure(job, external_id, "completed without transcript text");
                };

                let status = if job.kind.is_transcript_only() {
                    JobStatus::Ready
                } else {
                    JobStatus::Transcribed
                };
                let applied = self.db.with_conn(|conn| {
                    job_repo::complete_transcription(
                        conn,
                        &job.id,
                        external_id,
                        &transcript,
                        status,
                        COMPLETED_DETAIL,
                    )
                })?;
                if !applied {
                    debug!("Transcript {} already applied", external_id);
                    return Ok(ApplyOutcome::AlreadyApplied);
                }
                info!(
                    "Job {} transcribed ({} words)",
                    job.id,
                    transcript.word_count
                );

                if status == JobStatus::Ready {
                    return Ok(ApplyOutcome::Applied { status, run: None });
                }
                let run = self.dispatch_analysis(&job.id)?;
                Ok(ApplyOutcome::Applied {
                    status,
                    run: Some(run),
                })
            }
        }
    }

    fn apply_failure(
        &self,
        job: &ProcessingJob,
        external_id: &str,
        message: &str,
    ) -> Result<ApplyOutcome, GatewayError> {
        let error = truncate(&format!("Transcription failed: {}", message), MAX_ERROR_LENGTH);
        let applied = self
            .db
            .with_conn(|conn| job_repo::fail_transcription(conn, &job.id, external_id, &error))?;
        if !applied {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        warn!("Job {}: {}", job.id, error);
        Ok(ApplyOutcome::Applied {
            status: JobStatus::Error,
            run: None,
        })
    }

    fn dispatch_analysis(&self, job_id: &str) -> Result<RunHandle, GatewayError> {
        let job = self
            .db
            .with_conn(|conn| job_repo::find_by_id(conn, job_id))?
            .ok_or_else(|| GatewayError::NotFound {
                job_id: job_id.to_string(),
            })?;
        match self.runner.run(&job, Stage::Analysis, &[Stage::Transcription]) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.record_failure(job_id, &format!("Failed to dispatch analysis: {}", e));
                Err(e.into())
            }
        }
    }
}
