//! Periodic sweep over jobs that lost their callback or their worker.
//!
//! Each pass polls the provider for outstanding submissions, hands stalled
//! jobs to the recovery controller and purges expired guard rows. Runs on
//! its own thread with a current-thread runtime and can be woken early
//! through a broadcast trigger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use super::controller::RecoveryController;
use super::error::RecoveryError;
use crate::config::SweeperConfig;
use crate::db::{guard_repo, job_repo, now_ms, Database};
use crate::guard::STAGE_RUNNER_PREFIX;
use crate::transcription::{ApplyOutcome, TranscriptionGateway};

#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub interval: Duration,
    pub stall_after: Duration,
    pub batch_size: u64,
    pub poll_concurrency: usize,
}

impl From<&SweeperConfig> for SweepSettings {
    fn from(config: &SweeperConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            stall_after: Duration::from_secs(config.stall_after_secs),
            batch_size: config.batch_size,
            poll_concurrency: config.poll_concurrency.max(1),
        }
    }
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub polled: usize,
    pub transcripts_applied: usize,
    pub recovered: usize,
    pub failed: usize,
    pub guards_purged: usize,
}

pub struct Sweeper {
    db: Database,
    gateway: Arc<TranscriptionGateway>,
    controller: Arc<RecoveryController>,
    settings: SweepSettings,
    shutdown: Arc<AtomicBool>,
}

impl Sweeper {
    pub fn new(
        db: Database,
        gateway: Arc<TranscriptionGateway>,
        controller: Arc<RecoveryController>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            db,
            gateway,
            controller,
            settings,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs one pass.
    pub async fn sweep_once(&self) -> Result<SweepReport, RecoveryError> {
        let mut report = SweepReport::default();
        let batch = self.settings.batch_size;

        let outstanding = self
            .db
            .with_conn(|conn| job_repo::find_outstanding_transcriptions(conn, batch))?;
        report.polled = outstanding.len();

        let results: Vec<_> = stream::iter(outstanding)
            .map(|job| async move {
                let outcome = self.gateway.poll(&job.id).await;
                (job.id, outcome)
            })
            .buffer_unordered(self.settings.poll_concurrency)
            .collect()
            .await;
        for (job_id, outcome) in results {
            match outcome {
                Ok(ApplyOutcome::Applied { status, .. }) => {
                    info!("Sweep applied transcript result to job {} ({})", job_id, status);
                    report.transcripts_applied += 1;
                }
                Ok(other) => debug!("Sweep poll of job {}: {:?}", job_id, other),
                Err(e) => {
                    warn!("Sweep poll of job {} failed: {}", job_id, e);
                    report.failed += 1;
                }
            }
        }

        let stall_after = chrono::Duration::from_std(self.settings.stall_after)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = chrono::Utc::now() - stall_after;
        let stalled = self.db.with_conn(|conn| {
            job_repo::find_stalled(conn, cutoff, STAGE_RUNNER_PREFIX, now_ms(), batch)
        })?;
        for job in stalled {
            match self.controller.decide_and_act(&job.id).await {
                Ok(outcome) => {
                    info!(
                        "Sweep recovered job {}: {:?} -> {}",
                        job.id, outcome.action_taken, outcome.resulting_status
                    );
                    report.recovered += 1;
                }
                Err(e) => {
                    warn!("Sweep could not recover job {}: {}", job.id, e);
                    report.failed += 1;
                }
            }
        }

        report.guards_purged = self
            .db
            .with_conn(|conn| guard_repo::purge_expired(conn, now_ms()))?;

        Ok(report)
    }

    /// Starts the sweep loop in a background thread.
    /// Accepts a trigger receiver for manual sweep requests.
    pub fn start(self: &Arc<Self>, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let sweeper = Arc::clone(self);

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Sweeper failed to create runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(sweeper.settings.interval);
                interval_timer.tick().await; // skip immediate first tick

                loop {
                    if sweeper.shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            info!("Manual sweep triggered");
                        },
                    }

                    if sweeper.shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    match sweeper.sweep_once().await {
                        Ok(report) if report != SweepReport::default() => {
                            info!("Sweep finished: {:?}", report);
                        }
                        Ok(_) => {}
                        Err(e) => error!("Sweep failed: {}", e),
                    }
                }
            });
        })
    }

    /// Signals the sweep loop to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
