//! mediaflow - media processing pipeline orchestrator.
//!
//! `serve` runs the HTTP API, the stage workers and the recovery sweep in
//! one process. The remaining subcommands are one-shot operator tools.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use tokio::signal;
use tokio::sync::broadcast;

use mediaflow::app::database_path;
use mediaflow::broadcast::{log_pending_events, JobProgressEvent};
use mediaflow::config::{load_config, Config};
use mediaflow::db::Database;
use mediaflow::recovery::SweepSettings;
use mediaflow::telemetry::init_logging;
use mediaflow::worker::{WorkerPool, WorkerSettings};
use mediaflow::App;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "mediaflow")]
#[command(about = "Media processing pipeline orchestrator")]
#[command(version)]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, env = "MEDIAFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API, workers and recovery sweep
    Serve,
    /// Run workers and the recovery sweep without the HTTP API
    Work,
    /// Recover one job through the decision table
    Restart { job_id: String },
    /// Poll the provider for one job's transcript
    Poll { job_id: String },
    /// Run a single recovery sweep and exit
    Sweep,
    /// Create or upgrade the database schema and exit
    Migrate,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    init_logging(&config.logging).context("Failed to initialize logging")?;

    info!("Starting mediaflow v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Migrate => {
            let path = database_path(&config)?;
            Database::open(&path).context("Failed to migrate database")?;
            info!("Database schema is up to date at {}", path.display());
            Ok(())
        }
        Command::Serve => serve(&config),
        Command::Work => work(&config),
        Command::Restart { job_id } => {
            let app = App::from_config(&config)?;
            let outcome = block_on(app.controller.decide_and_act(&job_id))??;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Poll { job_id } => {
            let app = App::from_config(&config)?;
            let outcome = block_on(app.gateway.poll(&job_id))??;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Sweep => {
            let app = App::from_config(&config)?;
            let sweeper = app.sweeper(SweepSettings::from(&config.sweeper));
            let report = block_on(sweeper.sweep_once())??;
            info!("Sweep finished: {:?}", report);
            Ok(())
        }
    }
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create runtime")?;
    Ok(rt.block_on(future))
}

/// Background services shared by `serve` and `work`.
struct Services {
    stop: Arc<AtomicBool>,
    results: JoinHandle<()>,
    sweeper: Option<(Arc<mediaflow::Sweeper>, JoinHandle<()>, broadcast::Sender<()>)>,
}

impl Services {
    fn start(app: &App, config: &Config) -> Result<Self> {
        let pool = app
            .start_workers(WorkerSettings::from(&config.workers))
            .context("Failed to start workers")?;
        let stop = Arc::new(AtomicBool::new(false));
        let results = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("mediaflow-results".to_string())
                .spawn({
                    let progress = app.progress.subscribe();
                    move || drain_results(pool, progress, &stop)
                })
                .context("Failed to spawn result thread")?
        };

        let sweeper = if config.sweeper.enabled {
            let sweeper = Arc::new(app.sweeper(SweepSettings::from(&config.sweeper)));
            let (trigger_tx, trigger_rx) = broadcast::channel(4);
            let handle = sweeper.start(trigger_rx);
            info!("Recovery sweep every {}s", config.sweeper.interval_secs);
            Some((sweeper, handle, trigger_tx))
        } else {
            warn!("Recovery sweep is disabled");
            None
        };

        Ok(Self {
            stop,
            results,
            sweeper,
        })
    }

    fn shutdown(self) {
        if let Some((sweeper, handle, trigger_tx)) = self.sweeper {
            sweeper.stop();
            // Wakes the loop so it observes the stop flag.
            let _ = trigger_tx.send(());
            if handle.join().is_err() {
                warn!("Sweeper thread panicked");
            }
        }
        self.stop.store(true, Ordering::Release);
        if self.results.join().is_err() {
            warn!("Result thread panicked");
        }
        info!("Shutdown complete");
    }
}

fn drain_results(
    pool: WorkerPool,
    mut progress: broadcast::Receiver<JobProgressEvent>,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Acquire) {
        log_pending_events(&mut progress);
        if let Some(result) = pool.recv_result_timeout(RESULT_POLL_INTERVAL) {
            match result.outcome {
                Ok(outcome) => debug!(
                    "Delivery {} for job {} finished: {:?}",
                    result.delivery_id, result.job_id, outcome
                ),
                Err(e) => warn!(
                    "Delivery {} for job {} failed: {}",
                    result.delivery_id, result.job_id, e
                ),
            }
        }
    }
    pool.shutdown();
    pool.wait();
}

fn serve(config: &Config) -> Result<()> {
    let app = App::from_config(config)?;
    let services = Services::start(&app, config)?;
    let router = mediaflow::api::router(app, &config.provider.webhook_path);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create runtime")?;
    let served = rt.block_on(async {
        let listener = tokio::net::TcpListener::bind(&config.server.bind)
            .await
            .with_context(|| format!("Failed to bind to {}", config.server.bind))?;
        info!("Starting HTTP server on {}", config.server.bind);
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")
    });

    services.shutdown();
    served
}

fn work(config: &Config) -> Result<()> {
    let app = App::from_config(config)?;
    let services = Services::start(&app, config)?;

    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("Failed to set Ctrl+C handler")?;

    info!("Workers running. Press Ctrl+C to stop.");
    let _ = rx.recv();
    info!("Received Ctrl+C, shutting down");

    services.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
