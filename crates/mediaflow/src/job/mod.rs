//! The processing job record and its typed progress.

pub mod model;
pub mod stage;
pub mod transcript;

pub use model::{ArtifactKind, JobStatus, ProcessingJob, Progress, ProviderJob};
pub use stage::{AnalysisStep, Stage};
pub use transcript::{normalize, StructuredTranscript};
