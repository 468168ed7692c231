//! The `/admin` routes: dead-letter browsing, health, metrics.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use conveyor_core::EngineHandle;

use crate::error::ApiError;
use crate::schemas::JobResponse;

#[derive(Debug, Deserialize)]
pub struct DlqPageQuery {
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

fn default_limit() -> u64 {
    50
}

/// `GET /admin/dlq/jobs`: page through dead-lettered jobs.
pub async fn dlq_jobs(
    State(handle): State<EngineHandle>,
    Query(query): Query<DlqPageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !(1..=100).contains(&query.limit) {
        return Err(ApiError::bad_request("limit must be within 1..=100"));
    }
    let (jobs, total) = handle.dead_letter_list(query.offset, query.limit).await?;
    Ok(Json(json!({
        "jobs": jobs,
        "total": total,
        "limit": query.limit,
        "offset": query.offset,
        "has_more": query.offset + query.limit < total,
    })))
}

/// `GET /admin/dlq/stats`: rollup counters plus the most recent failures.
pub async fn dlq_stats(
    State(handle): State<EngineHandle>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (stats, recent) = handle.dead_letter_stats().await?;
    Ok(Json(json!({
        "stats": stats,
        "recent_failures": recent,
    })))
}

/// `POST /admin/dlq/retry/{id}`: pull an entry out of the sink and
/// resubmit it as a fresh job.
pub async fn dlq_retry(
    State(handle): State<EngineHandle>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let submitted = handle
        .retry_from_dead_letter(id)
        .await
        .map_err(|err| match err {
            conveyor_core::QueueError::NotFound(_) => {
                ApiError::not_found("Job not found in dead letter queue")
            }
            other => other.into(),
        })?;
    let response = JobResponse::from(submitted.details);
    Ok(Json(json!({
        "message": "Job successfully retried from DLQ",
        "original_job_id": id,
        "new_job_id": response.job_id,
        "status": response.status,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct DlqClearQuery {
    pub job_type: Option<String>,
}

/// `DELETE /admin/dlq/clear`: drop entries, optionally one type only.
pub async fn dlq_clear(
    State(handle): State<EngineHandle>,
    Query(query): Query<DlqClearQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cleared = handle.clear_dead_letters(query.job_type.as_deref()).await?;
    let message = match &query.job_type {
        Some(kind) => format!("Cleared {cleared} jobs from DLQ (type: {kind})"),
        None => format!("Cleared {cleared} jobs from DLQ"),
    };
    Ok(Json(json!({
        "message": message,
        "cleared_count": cleared,
    })))
}

/// `GET /admin/system/health`: component reachability.
pub async fn system_health(
    State(handle): State<EngineHandle>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let health = handle.health().await;
    Ok(Json(json!({
        "status": health.status,
        "services": {
            "database": if health.database { "healthy" } else { "unhealthy" },
            "queue_store": if health.queue_store { "healthy" } else { "unhealthy" },
            "dead_letter_store": if health.dead_letter_store { "healthy" } else { "unhealthy" },
        },
    })))
}

/// `GET /admin/system/metrics`: counts by status, success rate, ledger
/// and queue depths.
pub async fn system_metrics(
    State(handle): State<EngineHandle>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let metrics = handle.metrics().await?;
    Ok(Json(json!({
        "job_counts": metrics.job_counts,
        "success_rate_percent": metrics.success_rate_percent,
        "dead_letter_queue": metrics.dead_letter,
        "system_load": {
            "currently_running": metrics.currently_running,
            "pending_jobs": metrics.waiting_jobs,
            "resources": metrics.resources,
            "queue_depths": metrics.queue_depths,
        },
    })))
}
