use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("Transcription error: {0}")]
    Gateway(#[from] crate::transcription::GatewayError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] crate::recovery::RecoveryError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Provider setup failed: {0}")]
    Provider(#[from] crate::transcription::ProviderError),

    #[error("Analysis setup failed: {0}")]
    Analysis(#[from] crate::pipeline::AnalysisError),

    #[error("Logging setup failed: {0}")]
    Telemetry(#[from] crate::telemetry::TelemetryError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid URL for '{field}': {reason}")]
    InvalidUrl { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Delivery {delivery_id} failed: {reason}")]
    DeliveryFailed { delivery_id: i64, reason: String },
}

pub type Result<T> = std::result::Result<T, MediaflowError>;
