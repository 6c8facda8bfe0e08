use thiserror::Error;

use crate::db::DatabaseError;
use crate::pipeline::PipelineError;

/// Failure talking to the transcription provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure, timeout, rate limit or 5xx. Worth retrying.
    #[error("Transient provider failure: {message}")]
    Transient { message: String },

    /// The provider rejected the request. Retrying the same input won't help.
    #[error("Provider rejected request: {message}")]
    Terminal { message: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Failed to sign media URL: {0}")]
    Encode(#[from] jsonwebtoken::errors::Error),

    #[error("Invalid media URL for '{media_ref}': {reason}")]
    InvalidUrl { media_ref: String, reason: String },
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Job not found: {job_id}")]
    NotFound { job_id: String },

    #[error("Job {job_id} has no media to transcribe")]
    MissingMedia { job_id: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error("Failed to dispatch analysis: {0}")]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Provider(e) => e.is_retryable(),
            GatewayError::Database(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let transient = ProviderError::Transient {
            message: "timeout".to_string(),
        };
        let terminal = ProviderError::Terminal {
            message: "400".to_string(),
        };
        assert!(transient.is_retryable());
        assert!(!terminal.is_retryable());
        assert!(GatewayError::from(transient).is_retryable());
        assert!(!GatewayError::from(terminal).is_retryable());
        assert!(!GatewayError::MissingMedia {
            job_id: "j".to_string()
        }
        .is_retryable());
    }
}
