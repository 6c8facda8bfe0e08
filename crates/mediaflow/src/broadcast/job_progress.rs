//! Job progress broadcaster for real-time job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{AnalysisStep, Stage};

/// Phase of a stage run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Transcribing,
    AwaitingTranscript,
    Analyzing,
    Completed,
    Failed,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Queued => write!(f, "Queued"),
            JobPhase::Transcribing => write!(f, "Transcribing"),
            JobPhase::AwaitingTranscript => write!(f, "Awaiting transcript"),
            JobPhase::Analyzing => write!(f, "Analyzing"),
            JobPhase::Completed => write!(f, "Completed"),
            JobPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl From<Stage> for JobPhase {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Transcription => JobPhase::Transcribing,
            Stage::Analysis => JobPhase::Analyzing,
        }
    }
}

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    /// Run that produced the event.
    pub run_token: String,
    pub phase: JobPhase,
    /// Analysis step, while analyzing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<AnalysisStep>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgressEvent {
    pub fn new(job_id: &str, run_token: &str, phase: JobPhase, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            run_token: run_token.to_string(),
            phase,
            step: None,
            message: message.to_string(),
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn step(job_id: &str, run_token: &str, step: AnalysisStep) -> Self {
        Self {
            step: Some(step),
            ..Self::new(job_id, run_token, JobPhase::Analyzing, step.detail())
        }
    }

    pub fn failed(job_id: &str, run_token: &str, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(job_id, run_token, JobPhase::Failed, "Processing failed")
        }
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    /// Creates a tracker for one run and announces it as queued.
    pub fn start_run(&self, job_id: &str, run_token: &str) -> JobProgressTracker {
        let tracker = JobProgressTracker {
            job_id: job_id.to_string(),
            run_token: run_token.to_string(),
            sender: Arc::clone(&self.sender),
        };
        tracker.send(JobProgressEvent::new(
            job_id,
            run_token,
            JobPhase::Queued,
            "Run picked up",
        ));
        tracker
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Logs every event waiting on `rx` at debug level without blocking.
/// Returns how many events were logged.
pub fn log_pending_events(rx: &mut broadcast::Receiver<JobProgressEvent>) -> usize {
    let mut logged = 0;
    loop {
        match rx.try_recv() {
            Ok(event) => {
                match (&event.step, &event.error) {
                    (_, Some(error)) => log::debug!(
                        "Job {} run {}: {} ({})",
                        event.job_id, event.run_token, event.phase, error
                    ),
                    (Some(step), None) => log::debug!(
                        "Job {} run {}: {} step {}",
                        event.job_id, event.run_token, event.phase, step
                    ),
                    (None, None) => log::debug!(
                        "Job {} run {}: {} - {}",
                        event.job_id, event.run_token, event.phase, event.message
                    ),
                }
                logged += 1;
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                log::debug!("Progress log skipped {} events", skipped);
            }
            Err(_) => return logged,
        }
    }
}

/// Tracks progress for a single run.
pub struct JobProgressTracker {
    job_id: String,
    run_token: String,
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressTracker {
    fn send(&self, event: JobProgressEvent) {
        let _ = self.sender.send(event);
    }

    pub fn update_phase(&self, phase: JobPhase, message: &str) {
        self.send(JobProgressEvent::new(
            &self.job_id,
            &self.run_token,
            phase,
            message,
        ));
    }

    pub fn step(&self, step: AnalysisStep) {
        self.send(JobProgressEvent::step(&self.job_id, &self.run_token, step));
    }

    pub fn failed(&self, error: &str) {
        self.send(JobProgressEvent::failed(&self.job_id, &self.run_token, error));
    }
}
