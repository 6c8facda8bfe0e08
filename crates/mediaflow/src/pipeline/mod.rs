//! Stage runner: dispatch of stage runs and their execution on workers.

pub mod analysis;
pub mod error;
pub mod executor;
pub mod progress;
pub mod runner;
pub mod trigger;

pub use analysis::{AnalysisEngine, AnalysisError, AnalysisRequest, HttpAnalysisEngine, StepReport};
pub use error::PipelineError;
pub use executor::{DeliveryLease, RunOutcome, StageExecutor};
pub use progress::{BroadcastProgress, NoopProgress, ProgressEvent, ProgressReporter};
pub use runner::StageRunner;
pub use trigger::{plan_stages, RunHandle, StageTrigger};
