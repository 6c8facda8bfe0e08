use crate::broadcast::job_progress::{JobPhase, JobProgressBroadcaster, JobProgressTracker};
use crate::job::{AnalysisStep, Stage};

/// Events emitted by the stage executor while a run progresses.
pub enum ProgressEvent {
    Stage { stage: Stage, message: String },
    Step { step: AnalysisStep },
    AwaitingTranscript,
    Completed,
    Failed { error: String },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Bridges executor events to the broadcast channel.
pub struct BroadcastProgress {
    tracker: JobProgressTracker,
}

impl BroadcastProgress {
    pub fn new(broadcaster: &JobProgressBroadcaster, job_id: &str, run_token: &str) -> Self {
        Self {
            tracker: broadcaster.start_run(job_id, run_token),
        }
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Stage { stage, message } => {
                self.tracker.update_phase(JobPhase::from(stage), &message);
            }
            ProgressEvent::Step { step } => self.tracker.step(step),
            ProgressEvent::AwaitingTranscript => {
                self.tracker
                    .update_phase(JobPhase::AwaitingTranscript, "Waiting for transcription");
            }
            ProgressEvent::Completed => {
                self.tracker
                    .update_phase(JobPhase::Completed, "Processing complete");
            }
            ProgressEvent::Failed { error } => self.tracker.failed(&error),
        }
    }
}
