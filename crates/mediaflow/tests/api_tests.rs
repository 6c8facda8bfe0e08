//! HTTP routes exercised in-process through the router.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use common::harness::TEST_WEBHOOK_SECRET;
use common::TestHarness;

use mediaflow::api::router;
use mediaflow::job::{ArtifactKind, JobStatus, ProcessingJob, Stage};
use mediaflow::transcription::WEBHOOK_AUTH_HEADER;

const WEBHOOK_PATH: &str = "/api/webhooks/transcription";

fn app(h: &TestHarness) -> Router {
    router(h.app.clone(), WEBHOOK_PATH)
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let h = TestHarness::new();
    let (status, body) = send(app(&h), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_create_and_get_job() {
    let h = TestHarness::new();
    let (status, created) = send(
        app(&h),
        post_json("/api/jobs", json!({"media_ref": "uploads/keynote.mp4"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["kind"], "video_upload");
    assert_eq!(created["status"], "draft");

    let id = created["id"].as_str().unwrap();
    let (status, job) = send(app(&h), get(&format!("/api/jobs/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["media_ref"], "uploads/keynote.mp4");

    let (status, list) = send(app(&h), get("/api/jobs?status=draft")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);
    assert_eq!(list["jobs"][0]["id"], id);
    assert_eq!(list["jobs"][0]["has_transcript"], false);
}

#[tokio::test]
async fn test_create_job_requires_input() {
    let h = TestHarness::new();
    let (status, body) = send(app(&h), post_json("/api/jobs", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_create_job_with_text_media_is_transcribed() {
    let h = TestHarness::new();
    let (status, created) = send(
        app(&h),
        post_json("/api/jobs", json!({"media_ref": "notes/meeting.txt"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["kind"], "meeting_recording");

    let id = created["id"].as_str().unwrap();
    let (status, body) = send(app(&h), post(&format!("/api/jobs/{}/restart", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action_taken"], "transcription_started");
    assert_eq!(h.provider.submission_count(), 1);
}

#[tokio::test]
async fn test_create_text_job_rejects_media() {
    let h = TestHarness::new();
    let (status, body) = send(
        app(&h),
        post_json(
            "/api/jobs",
            json!({"kind": "text", "media_ref": "notes/meeting.txt"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (_, list) = send(app(&h), get("/api/jobs")).await;
    assert_eq!(list["total"], 0);
}

#[tokio::test]
async fn test_get_unknown_job() {
    let h = TestHarness::new();
    let (status, body) = send(app(&h), get("/api/jobs/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_restart_reports_each_outcome() {
    let h = TestHarness::new();

    let media = h.insert(&ProcessingJob::new(ArtifactKind::AudioUpload).with_media("a.mp3"));
    let (status, body) = send(app(&h), post(&format!("/api/jobs/{}/restart", media))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action_taken"], "transcription_started");
    assert_eq!(body["resulting_status"], "processing");
    assert_eq!(body["already_in_flight"], false);

    // Repeating the call is safe and reports the submission as in flight.
    let (status, body) = send(app(&h), post(&format!("/api/jobs/{}/restart", media))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["already_in_flight"], true);
    assert_eq!(h.provider.submission_count(), 1);

    let empty = h.insert(&ProcessingJob::new(ArtifactKind::MeetingRecording));
    let (status, body) = send(app(&h), post(&format!("/api/jobs/{}/restart", empty))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "NOTHING_TO_PROCESS");
    assert_eq!(h.load(&empty).status, JobStatus::Draft);

    let mut ready = ProcessingJob::new(ArtifactKind::Text).with_transcript("notes");
    ready.status = JobStatus::Ready;
    ready.progress.completed_stages = vec![Stage::Analysis];
    let ready = h.insert(&ready);
    let (status, body) = send(app(&h), post(&format!("/api/jobs/{}/restart", ready))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action_taken"], "none");
    assert_eq!(body["status_detail"], "Already complete");

    let (status, _) = send(app(&h), post("/api/jobs/missing/restart")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_check_transcription() {
    let h = TestHarness::new();
    let id = h.insert(&ProcessingJob::new(ArtifactKind::VoiceMemo).with_media("memo.m4a"));

    let (status, body) = send(app(&h), post(&format!("/api/jobs/{}/check-transcription", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "nothing_to_poll");

    h.app.controller.decide_and_act(&id).await.unwrap();
    let (_, body) = send(app(&h), post(&format!("/api/jobs/{}/check-transcription", id))).await;
    assert_eq!(body["outcome"], "still_pending");
    assert_eq!(body["external_status"], "queued");

    h.provider.complete(&h.external_id(&id), "polled");
    let (_, body) = send(app(&h), post(&format!("/api/jobs/{}/check-transcription", id))).await;
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_webhook_requires_shared_secret() {
    let h = TestHarness::new();
    let id = h.insert(&ProcessingJob::new(ArtifactKind::AudioUpload).with_media("a.mp3"));
    h.app.controller.decide_and_act(&id).await.unwrap();
    let external_id = h.external_id(&id);
    let body = json!({
        "transcript_id": external_id,
        "status": "completed",
        "transcript": "hello"
    });

    let (status, error) = send(app(&h), post_json(WEBHOOK_PATH, body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["error"]["code"], "UNAUTHORIZED");
    assert!(h.load(&id).transcript_text.is_none());

    let request = Request::builder()
        .method("POST")
        .uri(WEBHOOK_PATH)
        .header("content-type", "application/json")
        .header(WEBHOOK_AUTH_HEADER, TEST_WEBHOOK_SECRET)
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, applied) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(applied["outcome"], "applied");
    assert_eq!(applied["status"], "transcribed");
    assert_eq!(applied["run"]["state"], "started");

    let job = h.load(&id);
    assert_eq!(job.transcript_text.as_deref(), Some("hello"));
    assert_eq!(job.progress.completed_stages, vec![Stage::Transcription]);
}
