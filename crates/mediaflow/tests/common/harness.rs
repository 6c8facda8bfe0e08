//! Test harness: an [`App`] over an in-memory database with scripted
//! collaborators, plus helpers to seed jobs and run queued triggers inline.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use mediaflow::config::MediaConfig;
use mediaflow::db::{job_repo, now_ms, queue_repo, Database};
use mediaflow::job::{ProcessingJob, Stage};
use mediaflow::pipeline::{
    DeliveryLease, NoopProgress, PipelineError, RunOutcome, StageRunner, StageTrigger,
};
use mediaflow::transcription::{CallbackPayload, MediaUrlSigner};
use mediaflow::{App, AppParts};

use super::fakes::{FakeEngine, FakeProvider};

pub const TEST_SIGNING_KEY: &str = "test-media-signing-key";
pub const TEST_WEBHOOK_SECRET: &str = "test-webhook-secret";
pub const TEST_WEBHOOK_URL: &str = "https://mediaflow.test/api/webhooks/transcription";

const TEST_LEASE: Duration = Duration::from_secs(60);

pub struct TestHarness {
    pub app: App,
    pub provider: Arc<FakeProvider>,
    pub engine: Arc<FakeEngine>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_provider(FakeProvider::new())
    }

    pub fn with_provider(provider: FakeProvider) -> Self {
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        let provider = Arc::new(provider);
        let engine = Arc::new(FakeEngine::new());

        let app = App::assemble(AppParts {
            db,
            provider: provider.clone(),
            engine: engine.clone(),
            signer: MediaUrlSigner::new(
                &MediaConfig::default(),
                SecretString::from(TEST_SIGNING_KEY.to_string()),
            ),
            webhook_url: Some(TEST_WEBHOOK_URL.to_string()),
            webhook_secret: Some(SecretString::from(TEST_WEBHOOK_SECRET.to_string())),
            run_ttl: Duration::from_secs(60),
            submit_ttl: Duration::from_secs(30),
        });

        Self {
            app,
            provider,
            engine,
        }
    }

    pub fn db(&self) -> &Database {
        &self.app.db
    }

    /// A second runner over the same database with its own guard TTL.
    pub fn runner_with_ttl(&self, ttl: Duration) -> StageRunner {
        StageRunner::new(self.app.db.clone(), ttl)
    }

    pub fn insert(&self, job: &ProcessingJob) -> String {
        self.db()
            .with_conn(|conn| job_repo::insert(conn, job))
            .expect("Failed to insert job");
        job.id.clone()
    }

    pub fn load(&self, id: &str) -> ProcessingJob {
        self.db()
            .with_conn(|conn| job_repo::find_by_id(conn, id))
            .expect("Failed to load job")
            .expect("Job not found")
    }

    pub fn completed_stages(&self, id: &str) -> Vec<Stage> {
        self.load(id).progress.completed_stages
    }

    pub fn pending_deliveries(&self, id: &str) -> u64 {
        self.db()
            .with_conn(|conn| queue_repo::pending_for_job(conn, id))
            .expect("Failed to count deliveries")
    }

    /// The outstanding provider submission id of a job.
    pub fn external_id(&self, id: &str) -> String {
        self.load(id)
            .progress
            .provider_job
            .expect("Job has no outstanding submission")
            .external_id
    }

    /// Claims the next visible delivery without executing it.
    pub fn claim(&self) -> Option<(i64, StageTrigger)> {
        let lease_ms = TEST_LEASE.as_millis() as i64;
        self.db()
            .with_conn(|conn| queue_repo::claim_next(conn, now_ms(), lease_ms))
            .expect("Failed to claim delivery")
            .map(|delivery| {
                let trigger =
                    StageTrigger::from_payload(&delivery.payload).expect("Undecodable trigger");
                (delivery.id, trigger)
            })
    }

    pub async fn execute(&self, delivery_id: i64, trigger: &StageTrigger) -> Result<RunOutcome, PipelineError> {
        let lease = DeliveryLease {
            delivery_id,
            lease: TEST_LEASE,
        };
        let outcome = self
            .app
            .executor
            .execute(trigger, Some(lease), &NoopProgress)
            .await;
        self.db()
            .with_conn(|conn| queue_repo::complete(conn, delivery_id))
            .expect("Failed to acknowledge delivery");
        outcome
    }

    /// Runs every queued trigger inline, the way a worker would, until the
    /// queue is empty.
    pub async fn drain_queue(&self) -> Vec<Result<RunOutcome, PipelineError>> {
        let mut outcomes = Vec::new();
        while let Some((delivery_id, trigger)) = self.claim() {
            outcomes.push(self.execute(delivery_id, &trigger).await);
        }
        outcomes
    }

    /// A webhook body the way the provider posts it.
    pub fn callback(&self, external_id: &str, status: &str, text: Option<&str>) -> CallbackPayload {
        let mut body = serde_json::json!({
            "transcript_id": external_id,
            "status": status,
        });
        if let Some(text) = text {
            body["transcript"] = serde_json::Value::String(text.to_string());
        }
        serde_json::from_value(body).expect("Invalid callback payload")
    }
}
