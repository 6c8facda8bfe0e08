pub mod api;
pub mod app;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod job;
pub mod pipeline;
pub mod recovery;
pub mod sanitize;
pub mod secrets;
pub mod telemetry;
pub mod transcription;
pub mod worker;

pub use app::{App, AppParts};
pub use broadcast::{JobPhase, JobProgressBroadcaster, JobProgressEvent};
pub use config::{load_config, Config};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, MediaflowError, Result, WorkerError};
pub use guard::IdempotencyGuard;
pub use job::{AnalysisStep, ArtifactKind, JobStatus, ProcessingJob, Stage};
pub use pipeline::{PipelineError, RunHandle, StageExecutor, StageRunner};
pub use recovery::{ActionTaken, Outcome, RecoveryController, RecoveryError, Sweeper};
pub use secrets::{resolve_secret, SecretError, ServiceSecrets};
pub use transcription::{ApplyOutcome, GatewayError, TranscriptionGateway};
pub use worker::WorkerPool;
