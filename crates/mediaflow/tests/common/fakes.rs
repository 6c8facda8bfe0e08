//! Scripted stand-ins for the transcription provider and analysis service.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use mediaflow::job::AnalysisStep;
use mediaflow::pipeline::{AnalysisEngine, AnalysisError, AnalysisRequest, StepReport};
use mediaflow::transcription::{ProviderError, SubmitRequest, Submission, TranscriptionProvider};

/// In-memory provider. Each submission gets a `tx-N` id whose document
/// stays `queued` until the test completes or fails it.
#[derive(Default)]
pub struct FakeProvider {
    submissions: AtomicUsize,
    fetches: AtomicUsize,
    documents: Mutex<HashMap<String, Value>>,
    requests: Mutex<Vec<SubmitRequest>>,
    submit_error: Mutex<Option<ProviderError>>,
    fetch_error: Mutex<Option<ProviderError>>,
    submit_delay: Mutex<Option<Duration>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds every submit call open for `delay` to widen race windows.
    pub fn with_submit_delay(self, delay: Duration) -> Self {
        *self.submit_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn fail_submissions_with(&self, error: ProviderError) {
        *self.submit_error.lock().unwrap() = Some(error);
    }

    pub fn fail_fetches_with(&self, error: Option<ProviderError>) {
        *self.fetch_error.lock().unwrap() = error;
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SubmitRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Marks the transcript finished with `text`.
    pub fn complete(&self, external_id: &str, text: &str) {
        self.documents.lock().unwrap().insert(
            external_id.to_string(),
            json!({
                "id": external_id,
                "status": "completed",
                "text": text,
                "language_code": "en",
                "utterances": [
                    {"speaker": "A", "text": text, "start": 0, "end": 1200}
                ]
            }),
        );
    }

    pub fn fail(&self, external_id: &str, message: &str) {
        self.documents.lock().unwrap().insert(
            external_id.to_string(),
            json!({"id": external_id, "status": "error", "error": message}),
        );
    }
}

#[async_trait]
impl TranscriptionProvider for FakeProvider {
    async fn submit(&self, request: &SubmitRequest) -> Result<Submission, ProviderError> {
        let delay = *self.submit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.submit_error.lock().unwrap().clone() {
            return Err(error);
        }

        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        let external_id = format!("tx-{}", n);
        self.requests.lock().unwrap().push(request.clone());
        self.documents.lock().unwrap().insert(
            external_id.clone(),
            json!({"id": external_id, "status": "queued"}),
        );
        Ok(Submission {
            external_id,
            status: "queued".to_string(),
        })
    }

    async fn fetch(&self, external_id: &str) -> Result<Value, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fetch_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.documents
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .ok_or_else(|| ProviderError::Terminal {
                message: format!("transcript {} not found", external_id),
            })
    }
}

/// Analysis engine that records every step it runs.
#[derive(Default)]
pub struct FakeEngine {
    steps: Mutex<Vec<(String, AnalysisStep)>>,
    fail_on: Mutex<Option<AnalysisStep>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, step: AnalysisStep) {
        *self.fail_on.lock().unwrap() = Some(step);
    }

    pub fn clear_failure(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    pub fn call_count(&self) -> usize {
        self.steps.lock().unwrap().len()
    }

    pub fn steps_for(&self, job_id: &str) -> Vec<AnalysisStep> {
        self.steps
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, step)| *step)
            .collect()
    }
}

#[async_trait]
impl AnalysisEngine for FakeEngine {
    async fn run_step(&self, request: &AnalysisRequest<'_>) -> Result<StepReport, AnalysisError> {
        if *self.fail_on.lock().unwrap() == Some(request.step) {
            return Err(AnalysisError::Status {
                status: 503,
                body: "analysis backend unavailable".to_string(),
            });
        }
        self.steps
            .lock()
            .unwrap()
            .push((request.job_id.to_string(), request.step));
        Ok(StepReport {
            items: 1,
            summary: Some(format!("{} done", request.step)),
        })
    }
}
