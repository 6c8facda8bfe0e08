//! AssemblyAI REST client.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ProviderError;
use super::provider::{SubmitRequest, Submission, TranscriptionProvider};
use crate::config::ProviderConfig;
use crate::sanitize::truncate;

/// Maximum length for provider error bodies kept in logs and `last_error`.
const MAX_ERROR_BODY_LENGTH: usize = 200;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest a single provider call can take before the client gives up.
pub const MAX_PROVIDER_CALL: Duration = Duration::from_secs(
    DEFAULT_CONNECT_TIMEOUT.as_secs() + DEFAULT_REQUEST_TIMEOUT.as_secs(),
);

/// Header the provider echoes on callbacks when a webhook secret is set.
pub const WEBHOOK_AUTH_HEADER: &str = "x-mediaflow-webhook-token";

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

pub struct AssemblyAiProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
    speech_model: Option<String>,
    speaker_labels: bool,
    webhook_secret: Option<SecretString>,
}

impl AssemblyAiProvider {
    pub fn new(
        config: &ProviderConfig,
        api_key: SecretString,
        webhook_secret: Option<SecretString>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Terminal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            speech_model: config.speech_model.clone(),
            speaker_labels: config.speaker_labels,
            webhook_secret,
        })
    }

    fn submit_body(&self, request: &SubmitRequest) -> Value {
        let mut body = json!({
            "audio_url": request.audio_url,
            "speaker_labels": self.speaker_labels,
            "punctuate": true,
            "format_text": true,
        });
        if let Some(model) = &self.speech_model {
            body["speech_model"] = json!(model);
        }
        if let Some(webhook_url) = &request.webhook_url {
            body["webhook_url"] = json!(webhook_url);
            if let Some(secret) = &self.webhook_secret {
                body["webhook_auth_header_name"] = json!(WEBHOOK_AUTH_HEADER);
                body["webhook_auth_header_value"] = json!(secret.expose_secret());
            }
        }
        body
    }
}

fn transport_error(context: &str, e: reqwest::Error) -> ProviderError {
    ProviderError::Transient {
        message: format!("{}: {}", context, e),
    }
}

/// Maps a non-success HTTP status to a retryable or terminal failure.
fn status_error(context: &str, status: StatusCode, body: &str) -> ProviderError {
    let message = format!(
        "{} returned {}: {}",
        context,
        status,
        truncate(body, MAX_ERROR_BODY_LENGTH)
    );
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Transient { message }
    } else {
        ProviderError::Terminal { message }
    }
}

#[async_trait]
impl TranscriptionProvider for AssemblyAiProvider {
    async fn submit(&self, request: &SubmitRequest) -> Result<Submission, ProviderError> {
        let url = format!("{}/v2/transcript", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("authorization", self.api_key.expose_secret())
            .json(&self.submit_body(request))
            .send()
            .await
            .map_err(|e| transport_error("Transcript submission failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("AssemblyAI rejected submission with {}", status);
            return Err(status_error("Transcript submission", status, &body));
        }

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        debug!("AssemblyAI accepted transcript {}", parsed.id);

        Ok(Submission {
            external_id: parsed.id,
            status: parsed.status.unwrap_or_else(|| "queued".to_string()),
        })
    }

    async fn fetch(&self, external_id: &str) -> Result<Value, ProviderError> {
        let url = format!("{}/v2/transcript/{}", self.base_url, external_id);
        let response = self
            .client
            .get(&url)
            .header("authorization", self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error("Transcript fetch failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("Transcript fetch", status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}
