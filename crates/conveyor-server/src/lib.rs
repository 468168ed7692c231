//! HTTP/WebSocket surface for the Conveyor job queue.
//!
//! Thin request marshalling over the engine handle: the admission API under
//! `/jobs`, the live stream at `/jobs/stream`, and the read-mostly admin
//! surface under `/admin`. All scheduling behavior lives in
//! `conveyor-core`; this crate validates requests, maps errors onto status
//! codes, and serializes responses.

mod admin;
mod error;
mod handlers;
mod jobs;
mod schemas;
mod stream;

pub use error::ApiError;
pub use handlers::register_demo_handlers;

use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use conveyor_core::EngineHandle;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the full application router over a running engine.
pub fn router(handle: EngineHandle) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/stream", get(stream::job_stream))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/cancel", patch(jobs::cancel_job))
        .route("/jobs/:id/logs", get(jobs::job_logs))
        .route("/admin/dlq/jobs", get(admin::dlq_jobs))
        .route("/admin/dlq/stats", get(admin::dlq_stats))
        .route("/admin/dlq/retry/:id", post(admin::dlq_retry))
        .route("/admin/dlq/clear", delete(admin::dlq_clear))
        .route("/admin/system/health", get(admin::system_health))
        .route("/admin/system/metrics", get(admin::system_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(handle)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Conveyor Job Queue API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}
