//! Wiring of the orchestrator's components around one database.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::broadcast::JobProgressBroadcaster;
use crate::config::Config;
use crate::db::{default_database_path, Database};
use crate::error::{ConfigError, MediaflowError, WorkerError};
use crate::pipeline::{AnalysisEngine, HttpAnalysisEngine, StageExecutor, StageRunner};
use crate::recovery::{RecoveryController, SweepSettings, Sweeper};
use crate::secrets::ServiceSecrets;
use crate::transcription::{
    AssemblyAiProvider, MediaUrlSigner, TranscriptionGateway, TranscriptionProvider,
};
use crate::worker::{WorkerPool, WorkerSettings};

/// Everything needed to assemble an [`App`]. Tests build this directly with
/// in-memory databases and scripted collaborators.
pub struct AppParts {
    pub db: Database,
    pub provider: Arc<dyn TranscriptionProvider>,
    pub engine: Arc<dyn AnalysisEngine>,
    pub signer: MediaUrlSigner,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<SecretString>,
    pub run_ttl: Duration,
    pub submit_ttl: Duration,
}

#[derive(Clone)]
pub struct App {
    pub db: Database,
    pub runner: Arc<StageRunner>,
    pub gateway: Arc<TranscriptionGateway>,
    pub executor: Arc<StageExecutor>,
    pub controller: Arc<RecoveryController>,
    pub progress: JobProgressBroadcaster,
    pub webhook_secret: Option<Arc<SecretString>>,
}

impl App {
    pub fn assemble(parts: AppParts) -> Self {
        let runner = Arc::new(StageRunner::new(parts.db.clone(), parts.run_ttl));
        let gateway = Arc::new(TranscriptionGateway::new(
            parts.db.clone(),
            parts.provider,
            parts.signer,
            Arc::clone(&runner),
            parts.webhook_url,
            parts.submit_ttl,
        ));
        let executor = Arc::new(StageExecutor::new(
            parts.db.clone(),
            Arc::clone(&gateway),
            parts.engine,
        ));
        let controller = Arc::new(RecoveryController::new(
            parts.db.clone(),
            Arc::clone(&gateway),
            Arc::clone(&runner),
        ));

        Self {
            db: parts.db,
            runner,
            gateway,
            executor,
            controller,
            progress: JobProgressBroadcaster::default(),
            webhook_secret: parts.webhook_secret.map(Arc::new),
        }
    }

    /// Opens the database and builds the production collaborators.
    pub fn from_config(config: &Config) -> Result<Self, MediaflowError> {
        let path = database_path(config)?;
        let db = Database::open(&path)?;
        let secrets = ServiceSecrets::resolve(config)?;

        let provider = AssemblyAiProvider::new(
            &config.provider,
            secrets.provider_api_key,
            secrets.webhook_secret.clone(),
        )?;
        let engine = HttpAnalysisEngine::new(&config.analysis, secrets.analysis_token)?;
        if config.analysis.endpoint.is_none() {
            log::warn!("analysis.endpoint is not set; analysis stages will fail");
        }
        let webhook_url = config.webhook_url();
        if webhook_url.is_none() {
            log::warn!("server.public_base_url is not set; transcripts arrive by polling only");
        }

        Ok(Self::assemble(AppParts {
            db,
            provider: Arc::new(provider),
            engine: Arc::new(engine),
            signer: MediaUrlSigner::new(&config.media, secrets.media_signing_key),
            webhook_url,
            webhook_secret: secrets.webhook_secret,
            run_ttl: Duration::from_secs(config.guard.run_ttl_secs),
            submit_ttl: Duration::from_secs(config.guard.submit_ttl_secs),
        }))
    }

    pub fn start_workers(&self, settings: WorkerSettings) -> Result<WorkerPool, WorkerError> {
        WorkerPool::start(
            self.db.clone(),
            Arc::clone(&self.executor),
            self.runner.wake_receiver(),
            settings,
            Some(self.progress.clone()),
        )
    }

    pub fn sweeper(&self, settings: SweepSettings) -> Sweeper {
        Sweeper::new(
            self.db.clone(),
            Arc::clone(&self.gateway),
            Arc::clone(&self.controller),
            settings,
        )
    }
}

pub fn database_path(config: &Config) -> Result<PathBuf, ConfigError> {
    match &config.database.path {
        Some(path) => Ok(PathBuf::from(path)),
        None => default_database_path().ok_or_else(|| ConfigError::Validation {
            message: "database.path is not set and no home directory was found".to_string(),
        }),
    }
}
