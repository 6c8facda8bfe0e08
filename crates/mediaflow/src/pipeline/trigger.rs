//! Queue payload of a stage runner dispatch and the handle returned to the
//! dispatcher.

use serde::{Deserialize, Serialize};

use crate::job::{ProcessingJob, Stage};

/// Message the dispatcher enqueues and a worker executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTrigger {
    pub job_id: String,
    pub resume_from: Stage,
    #[serde(default)]
    pub skip_stages: Vec<Stage>,
    /// Guard key the run holds.
    pub idempotency_key: String,
    pub idempotency_ttl_secs: u64,
    /// Token minted when the guard was acquired.
    pub run_token: String,
    /// Re-execute completed stages.
    #[serde(default)]
    pub rerun: bool,
}

impl StageTrigger {
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// What a dispatch did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunHandle {
    /// A new run was enqueued.
    Started { token: String },
    /// A live run already holds the job.
    AlreadyRunning { token: String },
    /// Every requested stage is done and the job is ready.
    UpToDate,
}

impl RunHandle {
    pub fn started(&self) -> bool {
        matches!(self, RunHandle::Started { .. })
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            RunHandle::Started { token } | RunHandle::AlreadyRunning { token } => Some(token),
            RunHandle::UpToDate => None,
        }
    }
}

/// Stages a run executes, in order: the kind's required stages from
/// `resume_from` onward, minus `skip`, minus completed ones unless `rerun`.
pub fn plan_stages(
    job: &ProcessingJob,
    resume_from: Stage,
    skip: &[Stage],
    rerun: bool,
) -> Vec<Stage> {
    job.kind
        .required_stages()
        .iter()
        .copied()
        .filter(|stage| *stage >= resume_from)
        .filter(|stage| !skip.contains(stage))
        .filter(|stage| rerun || !job.progress.has_completed(*stage))
        .collect()
}
