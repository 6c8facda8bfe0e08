//! Broadcasting of run progress for in-process subscribers.

pub mod job_progress;

pub use job_progress::{
    log_pending_events, JobPhase, JobProgressBroadcaster, JobProgressEvent, JobProgressTracker,
};
