//! HTTP surface: recovery trigger, provider webhook, job reads.

pub mod error;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};

use crate::app::App;

pub use error::ApiError;

pub fn router(app: App, webhook_path: &str) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/api/jobs",
            get(handlers::list_jobs).post(handlers::create_job),
        )
        .route("/api/jobs/:id", get(handlers::get_job))
        .route("/api/jobs/:id/restart", post(handlers::restart_job))
        .route(
            "/api/jobs/:id/check-transcription",
            post(handlers::check_transcription),
        )
        .route(webhook_path, post(handlers::transcription_webhook))
        .with_state(app)
}
