use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::broadcast::JobProgressBroadcaster;
use crate::config::WorkersConfig;
use crate::db::{guard_repo, job_repo, now_ms, queue_repo, Database, Delivery};
use crate::error::WorkerError;
use crate::pipeline::{
    BroadcastProgress, DeliveryLease, NoopProgress, ProgressReporter, RunOutcome, StageExecutor,
    StageTrigger,
};

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub count: usize,
    /// Visibility lease of a claimed delivery.
    pub lease: Duration,
    pub max_deliveries: u32,
    pub poll_interval: Duration,
}

impl From<&WorkersConfig> for WorkerSettings {
    fn from(config: &WorkersConfig) -> Self {
        Self {
            count: config.count.max(1),
            lease: Duration::from_secs(config.lease_secs),
            max_deliveries: config.max_deliveries,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// Result of handling one queue delivery.
#[derive(Debug)]
pub struct DeliveryResult {
    pub delivery_id: i64,
    pub job_id: String,
    pub outcome: Result<RunOutcome, WorkerError>,
}

pub struct WorkerPool {
    result_receiver: Receiver<DeliveryResult>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

struct WorkerContext {
    db: Database,
    executor: Arc<StageExecutor>,
    wake: Receiver<()>,
    results: Sender<DeliveryResult>,
    shutdown: Arc<AtomicBool>,
    settings: WorkerSettings,
    progress: Option<JobProgressBroadcaster>,
}

impl WorkerPool {
    /// Starts `settings.count` worker threads pulling from the dispatch queue.
    pub fn start(
        db: Database,
        executor: Arc<StageExecutor>,
        wake: Receiver<()>,
        settings: WorkerSettings,
        progress: Option<JobProgressBroadcaster>,
    ) -> Result<Self, WorkerError> {
        let worker_count = settings.count.max(1);
        let (result_sender, result_receiver) = bounded::<DeliveryResult>(worker_count * 16);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let ctx = WorkerContext {
                db: db.clone(),
                executor: Arc::clone(&executor),
                wake: wake.clone(),
                results: result_sender.clone(),
                shutdown: Arc::clone(&shutdown),
                settings,
                progress: progress.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("mediaflow-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, ctx))
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            result_receiver,
            workers,
            shutdown,
        })
    }

    pub fn try_recv_result(&self) -> Option<DeliveryResult> {
        self.result_receiver.try_recv().ok()
    }

    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<DeliveryResult> {
        self.result_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

fn run_worker(worker_id: usize, ctx: WorkerContext) {
    debug!("Worker {} started", worker_id);

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Worker {} failed to create runtime: {}", worker_id, e);
            return;
        }
    };
    let lease_ms = i64::try_from(ctx.settings.lease.as_millis()).unwrap_or(i64::MAX);

    while !ctx.shutdown.load(Ordering::Acquire) {
        match ctx
            .db
            .with_conn(|conn| queue_repo::claim_next(conn, now_ms(), lease_ms))
        {
            Ok(Some(delivery)) => {
                debug!(
                    "Worker {} claimed delivery {} (attempt {})",
                    worker_id, delivery.id, delivery.attempts
                );
                let result = process_delivery(&ctx, &rt, delivery);
                if ctx.results.try_send(result).is_err() {
                    debug!("Worker {} dropped a result: no reader", worker_id);
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => error!("Worker {} failed to claim from queue: {}", worker_id, e),
        }

        match ctx.wake.recv_timeout(ctx.settings.poll_interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(ctx.settings.poll_interval),
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn process_delivery(
    ctx: &WorkerContext,
    rt: &tokio::runtime::Runtime,
    delivery: Delivery,
) -> DeliveryResult {
    let failed = |reason: String| DeliveryResult {
        delivery_id: delivery.id,
        job_id: delivery.job_id.clone(),
        outcome: Err(WorkerError::DeliveryFailed {
            delivery_id: delivery.id,
            reason,
        }),
    };

    let trigger = match StageTrigger::from_payload(&delivery.payload) {
        Ok(trigger) => trigger,
        Err(e) => {
            let reason = format!("Undecodable trigger: {}", e);
            error!("Delivery {}: {}", delivery.id, reason);
            if let Err(e) = ctx
                .db
                .with_conn(|conn| queue_repo::bury(conn, delivery.id, &reason))
            {
                error!("Failed to bury delivery {}: {}", delivery.id, e);
            }
            return failed(reason);
        }
    };

    if delivery.attempts > ctx.settings.max_deliveries {
        let reason = format!(
            "Run abandoned after {} deliveries",
            ctx.settings.max_deliveries
        );
        warn!("Job {}: {}", trigger.job_id, reason);
        let abandoned = ctx.db.with_tx(|conn| {
            job_repo::fail_run(conn, &trigger.job_id, &trigger.run_token, &reason)?;
            guard_repo::release(conn, &trigger.idempotency_key, &trigger.run_token)?;
            queue_repo::bury(conn, delivery.id, &reason)
        });
        if let Err(e) = abandoned {
            error!("Failed to abandon delivery {}: {}", delivery.id, e);
        }
        return failed(reason);
    }

    let progress: Box<dyn ProgressReporter> = match &ctx.progress {
        Some(broadcaster) => Box::new(BroadcastProgress::new(
            broadcaster,
            &trigger.job_id,
            &trigger.run_token,
        )),
        None => Box::new(NoopProgress),
    };
    let lease = DeliveryLease {
        delivery_id: delivery.id,
        lease: ctx.settings.lease,
    };
    let outcome = rt.block_on(ctx.executor.execute(&trigger, Some(lease), progress.as_ref()));

    match outcome {
        Err(e) if e.is_retryable() => {
            // Left pending: the delivery reappears once its lease runs out.
            warn!(
                "Delivery {} for job {} will be retried: {}",
                delivery.id, trigger.job_id, e
            );
            failed(e.to_string())
        }
        outcome => {
            if let Err(e) = ctx
                .db
                .with_conn(|conn| queue_repo::complete(conn, delivery.id))
            {
                error!("Failed to acknowledge delivery {}: {}", delivery.id, e);
            }
            match outcome {
                Ok(run) => DeliveryResult {
                    delivery_id: delivery.id,
                    job_id: trigger.job_id,
                    outcome: Ok(run),
                },
                Err(e) => failed(e.to_string()),
            }
        }
    }
}
