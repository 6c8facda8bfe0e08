//! Job repository: targeted conditional updates for the `processing_jobs` table.
//!
//! Functions take a `&Connection` so callers can compose them inside
//! `Database::with_tx`. Every write that belongs to a dispatched run is
//! conditional on the run token (`in_flight_marker`) or on the provider's
//! external id, and reports through its `bool` result whether it applied.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;
use crate::job::{
    AnalysisStep, ArtifactKind, JobStatus, ProcessingJob, Progress, ProviderJob, Stage,
    StructuredTranscript,
};

/// A raw job row from the database.
#[derive(Debug, Clone)]
struct JobRow {
    id: String,
    kind: String,
    status: String,
    media_ref: Option<String>,
    transcript_text: Option<String>,
    transcript_structured: Option<String>,
    current_stage: Option<String>,
    completed_stages: String,
    status_detail: Option<String>,
    in_flight_marker: Option<String>,
    provider_external_id: Option<String>,
    provider_external_status: Option<String>,
    provider_callback_url: Option<String>,
    analysis_checkpoint: String,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            status: row.get("status")?,
            media_ref: row.get("media_ref")?,
            transcript_text: row.get("transcript_text")?,
            transcript_structured: row.get("transcript_structured")?,
            current_stage: row.get("current_stage")?,
            completed_stages: row.get("completed_stages")?,
            status_detail: row.get("status_detail")?,
            in_flight_marker: row.get("in_flight_marker")?,
            provider_external_id: row.get("provider_external_id")?,
            provider_external_status: row.get("provider_external_status")?,
            provider_callback_url: row.get("provider_callback_url")?,
            analysis_checkpoint: row.get("analysis_checkpoint")?,
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_job(self) -> Result<ProcessingJob, DatabaseError> {
        let kind = self
            .kind
            .parse::<ArtifactKind>()
            .map_err(|_| DatabaseError::InvalidValue {
                column: "kind",
                value: self.kind.clone(),
            })?;
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(|_| DatabaseError::InvalidValue {
                column: "status",
                value: self.status.clone(),
            })?;
        let transcript_structured = self
            .transcript_structured
            .as_deref()
            .map(serde_json::from_str::<StructuredTranscript>)
            .transpose()
            .map_err(|e| DatabaseError::Json {
                column: "transcript_structured",
                source: e,
            })?;

        let provider_job = self.provider_external_id.map(|external_id| ProviderJob {
            external_id,
            external_status: self.provider_external_status,
            callback_url: self.provider_callback_url,
        });

        Ok(ProcessingJob {
            id: self.id,
            kind,
            status,
            media_ref: self.media_ref,
            transcript_text: self.transcript_text,
            transcript_structured,
            progress: Progress {
                current_stage: self.current_stage.as_deref().and_then(parse_stage),
                completed_stages: parse_list(&self.completed_stages, "completed_stages"),
                status_detail: self.status_detail,
                in_flight_marker: self.in_flight_marker,
                provider_job,
                last_error: self.last_error,
                analysis_checkpoint: parse_list(&self.analysis_checkpoint, "analysis_checkpoint"),
            },
            created_at: parse_timestamp(&self.created_at, "created_at")?,
            updated_at: parse_timestamp(&self.updated_at, "updated_at")?,
        })
    }
}

// ─── Parsing helpers ────────────────────────────────────────────────────

fn parse_stage(s: &str) -> Option<Stage> {
    match s.parse::<Stage>() {
        Ok(stage) => Some(stage),
        Err(_) => {
            log::warn!("Unknown stage '{}' in job record, ignoring", s);
            None
        }
    }
}

/// Parses a JSON array of names, dropping entries that no longer map to a
/// variant so an old row never blocks recovery.
fn parse_list<T: std::str::FromStr>(json: &str, column: &str) -> Vec<T> {
    let names: Vec<String> = match serde_json::from_str(json) {
        Ok(names) => names,
        Err(e) => {
            log::warn!("Invalid JSON in column '{}': {}", column, e);
            return Vec::new();
        }
    };
    names
        .iter()
        .filter_map(|name| match name.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("Unknown entry '{}' in column '{}', ignoring", name, column);
                None
            }
        })
        .collect()
}

fn parse_timestamp(s: &str, column: &'static str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::InvalidValue {
            column,
            value: s.to_string(),
        })
}

fn encode_list<T: serde::Serialize>(items: &[T], column: &'static str) -> Result<String, DatabaseError> {
    serde_json::to_string(items).map_err(|e| DatabaseError::Json { column, source: e })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// SQL expression appending the stage bound at `?{param}` to
/// `completed_stages` unless already present. Evaluated inside the UPDATE so
/// the append is atomic across processes sharing the database file.
fn append_stage_expr(param: usize) -> String {
    format!(
        "CASE WHEN EXISTS (SELECT 1 FROM json_each(COALESCE(completed_stages, '[]')) \
         WHERE value = ?{p}) THEN completed_stages \
         ELSE json_insert(COALESCE(completed_stages, '[]'), '$[#]', ?{p}) END",
        p = param
    )
}

// ─── Reads ──────────────────────────────────────────────────────────────

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<ArtifactKind>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &ProcessingJob) -> Result<(), DatabaseError> {
    let structured = job
        .transcript_structured
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::Json {
            column: "transcript_structured",
            source: e,
        })?;
    let provider = job.progress.provider_job.as_ref();

    conn.execute(
        "INSERT INTO processing_jobs (id, kind, status, media_ref, transcript_text,
         transcript_structured, current_stage, completed_stages, status_detail,
         in_flight_marker, provider_external_id, provider_external_status,
         provider_callback_url, analysis_checkpoint, last_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            job.id,
            job.kind.as_str(),
            job.status.as_str(),
            job.media_ref,
            job.transcript_text,
            structured,
            job.progress.current_stage.map(|s| s.as_str()),
            encode_list(&job.progress.completed_stages, "completed_stages")?,
            job.progress.status_detail,
            job.progress.in_flight_marker,
            provider.map(|p| p.external_id.as_str()),
            provider.and_then(|p| p.external_status.as_deref()),
            provider.and_then(|p| p.callback_url.as_deref()),
            encode_list(&job.progress.analysis_checkpoint, "analysis_checkpoint")?,
            job.progress.last_error,
            job.created_at.to_rfc3339(),
            job.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<ProcessingJob>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM processing_jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?;
    row.map(JobRow::into_job).transpose()
}

/// Finds the job whose outstanding provider submission has this external id.
pub fn find_by_external_id(
    conn: &Connection,
    external_id: &str,
) -> Result<Option<ProcessingJob>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM processing_jobs WHERE provider_external_id = ?1",
            params![external_id],
            JobRow::from_row,
        )
        .optional()?;
    row.map(JobRow::into_job).transpose()
}

/// Queries jobs with filters, returning (jobs, total_count).
pub fn query(
    conn: &Connection,
    filter: &JobFilter,
) -> Result<(Vec<ProcessingJob>, u64), DatabaseError> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        conditions.push(format!("status = ?{}", param_values.len() + 1));
        param_values.push(Box::new(status.as_str()));
    }
    if let Some(kind) = filter.kind {
        conditions.push(format!("kind = ?{}", param_values.len() + 1));
        param_values.push(Box::new(kind.as_str()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM processing_jobs {}", where_clause);
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

    let limit = filter.limit.unwrap_or(100) as i64;
    let offset = filter.offset.unwrap_or(0) as i64;
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));
    let query_sql = format!(
        "SELECT * FROM processing_jobs {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
        where_clause,
        param_values.len() - 1,
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&query_sql)?;
    let rows = stmt
        .query_map(params_ref.as_slice(), JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    let jobs = rows
        .into_iter()
        .map(JobRow::into_job)
        .collect::<Result<Vec<_>, _>>()?;

    Ok((jobs, total))
}

/// Counts jobs with the given status.
pub fn count_by_status(conn: &Connection, status: JobStatus) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM processing_jobs WHERE status = ?1",
        params![status.as_str()],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Jobs with a provider submission outstanding, oldest update first.
pub fn find_outstanding_transcriptions(
    conn: &Connection,
    limit: u64,
) -> Result<Vec<ProcessingJob>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM processing_jobs
         WHERE provider_external_id IS NOT NULL AND status = 'processing'
         ORDER BY updated_at ASC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(JobRow::into_job).collect()
}

/// Jobs left mid-pipeline with nothing live working on them: not updated
/// since `updated_before`, no outstanding provider submission, and either no
/// run token or a run token whose stage runner guard is gone or expired.
pub fn find_stalled(
    conn: &Connection,
    updated_before: DateTime<Utc>,
    guard_prefix: &str,
    now_ms: i64,
    limit: u64,
) -> Result<Vec<ProcessingJob>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM processing_jobs j
         WHERE j.status IN ('processing', 'transcribed')
           AND j.provider_external_id IS NULL
           AND j.updated_at < ?1
           AND (j.in_flight_marker IS NULL OR NOT EXISTS (
               SELECT 1 FROM idempotency_guards g
               WHERE g.key = ?2 || j.id
                 AND g.token = j.in_flight_marker
                 AND g.expires_at_ms > ?3))
         ORDER BY j.updated_at ASC LIMIT ?4",
    )?;
    let rows = stmt
        .query_map(
            params![
                updated_before.to_rfc3339(),
                guard_prefix,
                now_ms,
                limit as i64
            ],
            JobRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(JobRow::into_job).collect()
}

// ─── Stage runner writes ────────────────────────────────────────────────

/// Records a new stage runner dispatch: the job enters `processing` with
/// `token` as its in-flight marker. A `rerun` also resets the analysis
/// checkpoint so every step executes again.
pub fn claim_run(
    conn: &Connection,
    id: &str,
    token: &str,
    stage: Stage,
    detail: &str,
    rerun: bool,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_jobs SET status = 'processing', current_stage = ?3,
         status_detail = ?4, in_flight_marker = ?2, last_error = NULL,
         analysis_checkpoint = CASE WHEN ?5 THEN '[]' ELSE analysis_checkpoint END,
         updated_at = ?6
         WHERE id = ?1",
        params![id, token, stage.as_str(), detail, rerun, now_rfc3339()],
    )?;
    Ok(changed == 1)
}

/// Records an analysis step as checkpointed for the run owning `token`.
pub fn record_analysis_step(
    conn: &Connection,
    id: &str,
    token: &str,
    checkpoint: &[AnalysisStep],
    detail: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_jobs SET analysis_checkpoint = ?3, current_stage = 'analysis',
         status_detail = ?4, updated_at = ?5
         WHERE id = ?1 AND in_flight_marker = ?2",
        params![
            id,
            token,
            encode_list(checkpoint, "analysis_checkpoint")?,
            detail,
            now_rfc3339()
        ],
    )?;
    Ok(changed == 1)
}

/// Appends `stage` to `completed_stages` (once) for the run owning `token`.
pub fn record_stage_complete(
    conn: &Connection,
    id: &str,
    token: &str,
    stage: Stage,
    detail: &str,
) -> Result<bool, DatabaseError> {
    let sql = format!(
        "UPDATE processing_jobs SET completed_stages = {}, current_stage = ?3,
         status_detail = ?4, updated_at = ?5
         WHERE id = ?1 AND in_flight_marker = ?2",
        append_stage_expr(3)
    );
    let changed = conn.execute(
        &sql,
        params![id, token, stage.as_str(), detail, now_rfc3339()],
    )?;
    Ok(changed == 1)
}

/// Ends the run owning `token` successfully: `ready`, marker cleared.
pub fn finish_run(
    conn: &Connection,
    id: &str,
    token: &str,
    detail: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_jobs SET status = 'ready', status_detail = ?3,
         in_flight_marker = NULL, last_error = NULL, updated_at = ?4
         WHERE id = ?1 AND in_flight_marker = ?2",
        params![id, token, detail, now_rfc3339()],
    )?;
    Ok(changed == 1)
}

/// Hands the job over to the transcription provider: the run owning `token`
/// stops holding the job while the provider works.
pub fn suspend_run(conn: &Connection, id: &str, token: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_jobs SET in_flight_marker = NULL, updated_at = ?3
         WHERE id = ?1 AND in_flight_marker = ?2",
        params![id, token, now_rfc3339()],
    )?;
    Ok(changed == 1)
}

/// Ends the run owning `token` with an error.
pub fn fail_run(
    conn: &Connection,
    id: &str,
    token: &str,
    error: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_jobs SET status = 'error', last_error = ?3,
         status_detail = 'Processing failed', in_flight_marker = NULL, updated_at = ?4
         WHERE id = ?1 AND in_flight_marker = ?2",
        params![id, token, error, now_rfc3339()],
    )?;
    Ok(changed == 1)
}

/// Unconditionally puts a job into `error` with a recorded cause.
pub fn mark_error(conn: &Connection, id: &str, error: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_jobs SET status = 'error', last_error = ?2,
         status_detail = 'Processing failed', updated_at = ?3
         WHERE id = ?1",
        params![id, error, now_rfc3339()],
    )?;
    Ok(changed == 1)
}

// ─── Transcription gateway writes ───────────────────────────────────────

/// Persists a provider submission. Only applies while no other submission
/// is outstanding for the job.
pub fn record_submission(
    conn: &Connection,
    id: &str,
    provider_job: &ProviderJob,
    detail: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_jobs SET status = 'processing', current_stage = 'transcription',
         status_detail = ?5, provider_external_id = ?2, provider_external_status = ?3,
         provider_callback_url = ?4, last_error = NULL, updated_at = ?6
         WHERE id = ?1 AND provider_external_id IS NULL",
        params![
            id,
            provider_job.external_id,
            provider_job.external_status,
            provider_job.callback_url,
            detail,
            now_rfc3339()
        ],
    )?;
    Ok(changed == 1)
}

/// Refreshes the provider-side status of an outstanding submission.
pub fn update_external_status(
    conn: &Connection,
    id: &str,
    external_id: &str,
    external_status: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_jobs SET provider_external_status = ?3, updated_at = ?4
         WHERE id = ?1 AND provider_external_id = ?2",
        params![id, external_id, external_status, now_rfc3339()],
    )?;
    Ok(changed == 1)
}

/// Stores a finished transcript and closes the provider submission.
///
/// Conditional on `external_id` still being the outstanding submission, so
/// the first of webhook and poll to arrive applies and the other is a no-op.
pub fn complete_transcription(
    conn: &Connection,
    id: &str,
    external_id: &str,
    transcript: &StructuredTranscript,
    status: JobStatus,
    detail: &str,
) -> Result<bool, DatabaseError> {
    let structured = serde_json::to_string(transcript).map_err(|e| DatabaseError::Json {
        column: "transcript_structured",
        source: e,
    })?;
    let sql = format!(
        "UPDATE processing_jobs SET transcript_text = ?3, transcript_structured = ?4,
         completed_stages = {}, status = ?6, status_detail = ?7,
         current_stage = ?5, provider_external_id = NULL,
         provider_external_status = NULL, provider_callback_url = NULL,
         last_error = NULL, updated_at = ?8
         WHERE id = ?1 AND provider_external_id = ?2",
        append_stage_expr(5)
    );
    let changed = conn.execute(
        &sql,
        params![
            id,
            external_id,
            transcript.text,
            structured,
            Stage::Transcription.as_str(),
            status.as_str(),
            detail,
            now_rfc3339()
        ],
    )?;
    Ok(changed == 1)
}

/// Records a provider-side failure and closes the submission.
pub fn fail_transcription(
    conn: &Connection,
    id: &str,
    external_id: &str,
    error: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_jobs SET status = 'error', last_error = ?3,
         status_detail = 'Transcription failed', provider_external_id = NULL,
         provider_external_status = NULL, provider_callback_url = NULL, updated_at = ?4
         WHERE id = ?1 AND provider_external_id = ?2",
        params![id, external_id, error, now_rfc3339()],
    )?;
    Ok(changed == 1)
}
