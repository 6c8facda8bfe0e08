//! HTTP request handlers.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ApiError;
use crate::app::App;
use crate::db::job_repo::{self, JobFilter};
use crate::job::{ArtifactKind, JobStatus, ProcessingJob, Progress};
use crate::recovery::Outcome;
use crate::transcription::{ApplyOutcome, CallbackPayload, WEBHOOK_AUTH_HEADER};

const DEFAULT_PAGE_SIZE: u64 = 50;
const MAX_PAGE_SIZE: u64 = 500;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Job listing entry. Transcripts are only returned by the single-job route.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub kind: ArtifactKind,
    pub status: JobStatus,
    pub media_ref: Option<String>,
    pub has_transcript: bool,
    pub progress: Progress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ProcessingJob> for JobSummary {
    fn from(job: ProcessingJob) -> Self {
        Self {
            has_transcript: job.has_transcript(),
            id: job.id,
            kind: job.kind,
            status: job.status,
            media_ref: job.media_ref,
            progress: job.progress,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobSummary>,
    pub total: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobQueryParams {
    pub status: Option<JobStatus>,
    pub kind: Option<ArtifactKind>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

pub async fn list_jobs(
    State(app): State<App>,
    Query(params): Query<JobQueryParams>,
) -> Result<Json<JobListResponse>, ApiError> {
    let filter = JobFilter {
        status: params.status,
        kind: params.kind,
        limit: Some(params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE)),
        offset: params.offset,
    };
    let (jobs, total) = app.db.with_conn(|conn| job_repo::query(conn, &filter))?;
    Ok(Json(JobListResponse {
        jobs: jobs.into_iter().map(JobSummary::from).collect(),
        total,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub kind: Option<ArtifactKind>,
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(default)]
    pub transcript_text: Option<String>,
}

/// Registers a new artifact as a `draft` job. Processing starts with a
/// restart call.
pub async fn create_job(
    State(app): State<App>,
    Json(request): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let media_ref = request.media_ref.filter(|m| !m.trim().is_empty());
    let kind = match (request.kind, &media_ref, &request.transcript_text) {
        (Some(kind), _, _) => kind,
        (None, Some(media_ref), _) => ArtifactKind::infer_from_media_ref(media_ref),
        (None, None, Some(_)) => ArtifactKind::Text,
        (None, None, None) => {
            return Err(ApiError::BadRequest(
                "one of kind, media_ref or transcript_text is required".to_string(),
            ))
        }
    };
    if kind == ArtifactKind::Text && media_ref.is_some() {
        return Err(ApiError::BadRequest(
            "text jobs carry a transcript, not media".to_string(),
        ));
    }

    let mut job = ProcessingJob::new(kind);
    job.media_ref = media_ref;
    job.transcript_text = request.transcript_text;
    app.db.with_conn(|conn| job_repo::insert(conn, &job))?;
    info!(job_id = %job.id, kind = %job.kind, "Job created");

    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn get_job(
    State(app): State<App>,
    Path(job_id): Path<String>,
) -> Result<Json<ProcessingJob>, ApiError> {
    app.db
        .with_conn(|conn| job_repo::find_by_id(conn, &job_id))?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {}", job_id)))
}

/// User-triggered recovery. Safe to call repeatedly.
pub async fn restart_job(
    State(app): State<App>,
    Path(job_id): Path<String>,
) -> Result<Json<Outcome>, ApiError> {
    let outcome = app.controller.decide_and_act(&job_id).await?;
    Ok(Json(outcome))
}

/// On-demand provider poll for a job awaiting its transcript.
pub async fn check_transcription(
    State(app): State<App>,
    Path(job_id): Path<String>,
) -> Result<Json<ApplyOutcome>, ApiError> {
    let outcome = app.gateway.poll(&job_id).await?;
    Ok(Json(outcome))
}

/// Provider completion callback.
pub async fn transcription_webhook(
    State(app): State<App>,
    headers: HeaderMap,
    Json(payload): Json<CallbackPayload>,
) -> Result<Json<ApplyOutcome>, ApiError> {
    if let Some(secret) = &app.webhook_secret {
        let presented = headers
            .get(WEBHOOK_AUTH_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(secret.expose_secret()) {
            return Err(ApiError::Unauthorized);
        }
    }

    info!(
        external_id = %payload.external_id,
        status = %payload.status,
        "Transcription callback received"
    );
    let outcome = app.gateway.handle_callback(&payload).await?;
    Ok(Json(outcome))
}
