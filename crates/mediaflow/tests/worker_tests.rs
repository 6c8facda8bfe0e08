//! Worker pool and recovery sweep running against the durable queue.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use common::TestHarness;

use mediaflow::broadcast::JobPhase;
use mediaflow::guard::stage_runner_key;
use mediaflow::job::{ArtifactKind, JobStatus, ProcessingJob, Stage};
use mediaflow::pipeline::RunOutcome;
use mediaflow::recovery::{SweepReport, SweepSettings};
use mediaflow::worker::WorkerSettings;
use mediaflow::{IdempotencyGuard, WorkerError};

const RESULT_TIMEOUT: Duration = Duration::from_secs(10);

fn worker_settings(max_deliveries: u32) -> WorkerSettings {
    WorkerSettings {
        count: 2,
        lease: Duration::from_secs(30),
        max_deliveries,
        poll_interval: Duration::from_millis(50),
    }
}

fn sweep_settings() -> SweepSettings {
    SweepSettings {
        interval: Duration::from_secs(3600),
        stall_after: Duration::from_secs(60),
        batch_size: 50,
        poll_concurrency: 4,
    }
}

fn transcribed_job() -> ProcessingJob {
    let mut job = ProcessingJob::new(ArtifactKind::MeetingRecording)
        .with_media("recordings/retro.webm")
        .with_transcript("what went well");
    job.status = JobStatus::Transcribed;
    job.progress.completed_stages = vec![Stage::Transcription];
    job
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn test_worker_pool_completes_dispatched_run() {
    let h = TestHarness::new();
    let rt = runtime();
    let id = h.insert(&transcribed_job());
    let mut events = h.app.progress.subscribe();

    let pool = h.app.start_workers(worker_settings(3)).unwrap();
    rt.block_on(h.app.controller.decide_and_act(&id)).unwrap();

    let result = pool
        .recv_result_timeout(RESULT_TIMEOUT)
        .expect("no delivery result");
    assert_eq!(result.job_id, id);
    assert_eq!(result.outcome.unwrap(), RunOutcome::Completed);

    pool.shutdown();
    pool.wait();

    let job = h.load(&id);
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(h.pending_deliveries(&id), 0);

    let mut phases = Vec::new();
    let mut steps = 0;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id, id);
        if event.step.is_some() {
            steps += 1;
        }
        phases.push(event.phase);
    }
    assert_eq!(phases.first(), Some(&JobPhase::Queued));
    assert_eq!(phases.last(), Some(&JobPhase::Completed));
    assert!(phases.contains(&JobPhase::Analyzing));
    assert_eq!(steps, 5);
}

#[test]
fn test_delivery_abandoned_after_max_attempts() {
    let h = TestHarness::new();
    let rt = runtime();
    let id = h.insert(&transcribed_job());

    rt.block_on(h.app.controller.decide_and_act(&id)).unwrap();
    let token = h.load(&id).progress.in_flight_marker.unwrap();

    // Zero allowed deliveries: the first claim already exceeds the limit.
    let pool = h.app.start_workers(worker_settings(0)).unwrap();
    let result = pool
        .recv_result_timeout(RESULT_TIMEOUT)
        .expect("no delivery result");
    pool.shutdown();
    pool.wait();

    assert!(matches!(
        result.outcome,
        Err(WorkerError::DeliveryFailed { .. })
    ));
    let job = h.load(&id);
    assert_eq!(job.status, JobStatus::Error);
    assert!(job
        .progress
        .last_error
        .as_deref()
        .unwrap()
        .contains("abandoned"));
    assert!(job.progress.in_flight_marker.is_none());
    assert_eq!(h.pending_deliveries(&id), 0);

    let guard = IdempotencyGuard::new(h.db().clone());
    assert!(!guard.is_current(&stage_runner_key(&id), &token).unwrap());
    assert_eq!(h.engine.call_count(), 0);
}

#[tokio::test]
async fn test_sweep_polls_outstanding_transcriptions() {
    let h = TestHarness::new();
    let id = h.insert(
        &ProcessingJob::new(ArtifactKind::AudioUpload).with_media("uploads/lost-webhook.mp3"),
    );
    h.app.controller.decide_and_act(&id).await.unwrap();
    let external_id = h.external_id(&id);

    let sweeper = h.app.sweeper(sweep_settings());

    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.polled, 1);
    assert_eq!(report.transcripts_applied, 0);
    assert_eq!(h.load(&id).status, JobStatus::Processing);

    h.provider.complete(&external_id, "the webhook never came");
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.polled, 1);
    assert_eq!(report.transcripts_applied, 1);

    let job = h.load(&id);
    assert_eq!(job.status, JobStatus::Transcribed);
    assert_eq!(h.pending_deliveries(&id), 1);
}

#[tokio::test]
async fn test_sweep_recovers_stalled_jobs_only() {
    let h = TestHarness::new();
    let long_ago = Utc::now() - chrono::Duration::hours(2);

    // Worker died mid-run: marker set, no live guard behind it.
    let mut stalled = transcribed_job();
    stalled.status = JobStatus::Processing;
    stalled.progress.in_flight_marker = Some("run-from-dead-worker".to_string());
    stalled.updated_at = long_ago;
    let stalled_id = h.insert(&stalled);

    // Long-running but alive: its guard is still held.
    let mut alive = transcribed_job();
    alive.status = JobStatus::Processing;
    alive.updated_at = long_ago;
    let guard = IdempotencyGuard::new(h.db().clone());
    let lease = match guard
        .acquire(&stage_runner_key(&alive.id), Duration::from_secs(600))
        .unwrap()
    {
        mediaflow::guard::Acquire::Acquired(lease) => lease,
        other => panic!("expected to acquire, got {:?}", other),
    };
    alive.progress.in_flight_marker = Some(lease.token.clone());
    let alive_id = h.insert(&alive);

    // Recently touched: not stalled yet.
    let mut fresh = transcribed_job();
    fresh.status = JobStatus::Processing;
    let fresh_id = h.insert(&fresh);

    let report = h.app.sweeper(sweep_settings()).sweep_once().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.failed, 0);

    assert_eq!(h.pending_deliveries(&stalled_id), 1);
    assert_eq!(h.pending_deliveries(&alive_id), 0);
    assert_eq!(h.pending_deliveries(&fresh_id), 0);
    assert_eq!(
        h.load(&alive_id).progress.in_flight_marker.as_deref(),
        Some(lease.token.as_str())
    );

    h.drain_queue().await;
    assert_eq!(h.load(&stalled_id).status, JobStatus::Ready);
}

#[tokio::test]
async fn test_sweep_purges_expired_guards() {
    let h = TestHarness::new();
    let guard = IdempotencyGuard::new(h.db().clone());
    guard.acquire("stage-runner:gone", Duration::ZERO).unwrap();
    guard.acquire("stage-runner:live", Duration::from_secs(600)).unwrap();

    let report = h.app.sweeper(sweep_settings()).sweep_once().await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            guards_purged: 1,
            ..SweepReport::default()
        }
    );
}

#[test]
fn test_sweeper_thread_runs_on_trigger_and_stops() {
    let h = TestHarness::new();
    let rt = runtime();
    let id = h.insert(
        &ProcessingJob::new(ArtifactKind::VoiceMemo).with_media("memos/standup.m4a"),
    );
    rt.block_on(h.app.controller.decide_and_act(&id)).unwrap();
    let external_id = h.external_id(&id);
    h.provider.complete(&external_id, "ship it");

    let sweeper = Arc::new(h.app.sweeper(sweep_settings()));
    let (trigger_tx, trigger_rx) = broadcast::channel(4);
    let handle = sweeper.start(trigger_rx);
    trigger_tx.send(()).unwrap();

    let mut status = h.load(&id).status;
    for _ in 0..100 {
        if status == JobStatus::Ready {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
        status = h.load(&id).status;
    }
    assert_eq!(status, JobStatus::Ready);

    sweeper.stop();
    let _ = trigger_tx.send(());
    handle.join().unwrap();
}
