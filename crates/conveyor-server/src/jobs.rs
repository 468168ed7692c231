//! The `/jobs` routes: admission, queries, cancel, logs.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use conveyor_core::{EngineHandle, JobFilter};

use crate::error::ApiError;
use crate::schemas::{
    CreateJobRequest, JobListResponse, JobLogsResponse, JobResponse, ListJobsQuery,
};

/// `POST /jobs`: submit a job. 200 with the stored job (and queue
/// position) on success; 400 on validation problems, unknown dependencies
/// or cycles.
pub async fn create_job(
    State(handle): State<EngineHandle>,
    Json(request): Json<CreateJobRequest>,
) -> Result<Json<JobResponse>, ApiError> {
    request.validate()?;
    let submitted = handle.submit(request.into_spec()).await?;
    Ok(Json(JobResponse::from(submitted.details)))
}

/// `GET /jobs/{id}`: job status and details; 404 when unknown.
pub async fn get_job(
    State(handle): State<EngineHandle>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    let details = handle.get_job(id).await?;
    Ok(Json(JobResponse::from(details)))
}

/// `GET /jobs`: filtered, paginated listing ordered by `created_at` desc.
pub async fn list_jobs(
    State(handle): State<EngineHandle>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let filter = JobFilter {
        status: query.parsed_status()?,
        priority: query.parsed_priority()?,
        job_type: query.job_type.clone(),
    };
    let (details, total) = handle.list_jobs(&filter, query.page, query.per_page).await?;

    Ok(Json(JobListResponse {
        jobs: details.into_iter().map(JobResponse::from).collect(),
        total,
        page: query.page,
        per_page: query.per_page,
        has_next: u64::from(query.page) * u64::from(query.per_page) < total,
        has_prev: query.page > 1,
    }))
}

/// `PATCH /jobs/{id}/cancel`: allowed only while the job waits
/// (Pending/Ready/Blocked); 400 with state-specific wording otherwise.
pub async fn cancel_job(
    State(handle): State<EngineHandle>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    handle.cancel_job(id).await?;
    Ok(Json(json!({"message": "Job cancelled successfully"})))
}

/// `GET /jobs/{id}/logs`: audit log, newest first.
pub async fn job_logs(
    State(handle): State<EngineHandle>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobLogsResponse>, ApiError> {
    let logs = handle.job_logs(id).await?;
    Ok(Json(JobLogsResponse {
        total: logs.len() as u64,
        logs: logs.into_iter().map(Into::into).collect(),
    }))
}
