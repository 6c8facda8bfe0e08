//! Analysis engine seam. Each analysis step is one call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AnalysisConfig;
use crate::job::AnalysisStep;
use crate::sanitize::truncate;

const MAX_ERROR_BODY_LENGTH: usize = 200;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Analysis endpoint is not configured")]
    NotConfigured,

    #[error("Analysis request failed: {0}")]
    Request(String),

    #[error("Analysis service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid analysis response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest<'a> {
    pub job_id: &'a str,
    pub step: AnalysisStep,
    pub transcript: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StepReport {
    /// Items the step produced (evidence quotes, personas, answers...).
    #[serde(default)]
    pub items: u32,
    #[serde(default)]
    pub summary: Option<String>,
}

#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn run_step(&self, request: &AnalysisRequest<'_>) -> Result<StepReport, AnalysisError>;
}

/// Posts each step to an external analysis service.
pub struct HttpAnalysisEngine {
    client: Client,
    endpoint: Option<String>,
    token: Option<SecretString>,
}

impl HttpAnalysisEngine {
    pub fn new(config: &AnalysisConfig, token: Option<SecretString>) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AnalysisError::Request(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            token,
        })
    }
}

#[async_trait]
impl AnalysisEngine for HttpAnalysisEngine {
    async fn run_step(&self, request: &AnalysisRequest<'_>) -> Result<StepReport, AnalysisError> {
        let endpoint = self.endpoint.as_deref().ok_or(AnalysisError::NotConfigured)?;
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), request.step.as_str());

        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        let response = builder
            .send()
            .await
            .map_err(|e| AnalysisError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Status {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY_LENGTH),
            });
        }

        response
            .json()
            .await
            .map_err(|e| AnalysisError::InvalidResponse(e.to_string()))
    }
}
