//! Provider-neutral transcription contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::ProviderError;

/// One submission request: a readable media URL and where to call back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub audio_url: String,
    pub webhook_url: Option<String>,
}

/// Provider acknowledgement of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub external_id: String,
    pub status: String,
}

/// Provider-side state of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Pending { external_status: String },
    Completed { raw: Value },
    Failed { message: String },
}

impl ProviderEvent {
    /// Interprets a full provider transcript document.
    pub fn from_document(document: Value) -> Self {
        let status = document
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        match status.as_str() {
            "completed" => ProviderEvent::Completed { raw: document },
            "error" => ProviderEvent::Failed {
                message: document
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("Transcription failed")
                    .to_string(),
            },
            _ => ProviderEvent::Pending {
                external_status: status,
            },
        }
    }
}

#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    async fn submit(&self, request: &SubmitRequest) -> Result<Submission, ProviderError>;

    /// Fetches the provider's current transcript document for `external_id`.
    async fn fetch(&self, external_id: &str) -> Result<Value, ProviderError>;
}

/// Body the provider posts to the webhook route.
///
/// AssemblyAI sends only `transcript_id` and `status`. Richer providers may
/// inline the transcript, in which case no fetch is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    #[serde(alias = "transcript_id")]
    pub external_id: String,
    pub status: String,
    #[serde(default, alias = "transcript")]
    pub text: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CallbackPayload {
    /// The event carried by the payload, or `None` when the transcript has
    /// to be fetched from the provider first.
    pub fn event(&self) -> Option<ProviderEvent> {
        match self.status.as_str() {
            "completed" => {
                let text = self.text.as_ref()?;
                let mut raw = self.extra.clone();
                raw.insert("id".to_string(), Value::String(self.external_id.clone()));
                raw.insert("status".to_string(), Value::String(self.status.clone()));
                raw.insert("text".to_string(), Value::String(text.clone()));
                Some(ProviderEvent::Completed {
                    raw: Value::Object(raw),
                })
            }
            "error" => Some(ProviderEvent::Failed {
                message: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "Transcription failed".to_string()),
            }),
            other => Some(ProviderEvent::Pending {
                external_status: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_document() {
        assert!(matches!(
            ProviderEvent::from_document(json!({"id": "t1", "status": "completed", "text": "hi"})),
            ProviderEvent::Completed { .. }
        ));
        assert_eq!(
            ProviderEvent::from_document(json!({"status": "error", "error": "bad audio"})),
            ProviderEvent::Failed {
                message: "bad audio".to_string()
            }
        );
        assert_eq!(
            ProviderEvent::from_document(json!({"status": "processing"})),
            ProviderEvent::Pending {
                external_status: "processing".to_string()
            }
        );
    }

    #[test]
    fn test_assemblyai_callback_needs_fetch() {
        let payload: CallbackPayload =
            serde_json::from_value(json!({"transcript_id": "t1", "status": "completed"})).unwrap();
        assert_eq!(payload.external_id, "t1");
        assert!(payload.event().is_none());
    }

    #[test]
    fn test_inline_callback_carries_transcript() {
        let payload: CallbackPayload = serde_json::from_value(json!({
            "external_id": "t2",
            "status": "completed",
            "transcript": "hello there",
            "confidence": 0.9,
            "utterances": [{"speaker": "A", "text": "hello there"}]
        }))
        .unwrap();
        let Some(ProviderEvent::Completed { raw }) = payload.event() else {
            panic!("expected completion");
        };
        assert_eq!(raw["text"], "hello there");
        assert_eq!(raw["confidence"], 0.9);
        assert!(raw["utterances"].is_array());
    }

    #[test]
    fn test_error_callback() {
        let payload: CallbackPayload =
            serde_json::from_value(json!({"transcript_id": "t3", "status": "error"})).unwrap();
        assert_eq!(
            payload.event(),
            Some(ProviderEvent::Failed {
                message: "Transcription failed".to_string()
            })
        );
    }
}
