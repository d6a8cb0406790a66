//! Job API handlers
//!
//! POST /jobs, POST /jobs/demo, GET /jobs, GET /jobs/:id/status,
//! GET /jobs/:id/log, GET /jobs/:id/results, GET /jobs/:id/files/:name,
//! POST /jobs/:id/rerun

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::{JobParameters, JobStatus, JobSummary, JobType, LogEntry};
use crate::services::{ResultsView, SubmitRequest, SubmitResponse};
use crate::AppState;

/// GET /jobs/:id/status response
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub parameters: JobParameters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerun_of: Option<Uuid>,
}

/// GET /jobs/:id/log response
#[derive(Debug, Serialize)]
pub struct JobLogResponse {
    pub job_id: Uuid,
    pub lines: Vec<LogEntry>,
}

/// GET /jobs response
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobSummary>,
}

/// POST /jobs
///
/// Returns 202 Accepted once the job is persisted and launched.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let response = state.service.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// POST /jobs/demo
///
/// Body is optional; every field has a default.
pub async fn submit_demo_job(
    State(state): State<AppState>,
    request: Option<Json<SubmitRequest>>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let response = state.service.submit_demo(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /jobs
pub async fn list_jobs(State(state): State<AppState>) -> ApiResult<Json<JobListResponse>> {
    let jobs = state.service.list_jobs().await?;
    Ok(Json(JobListResponse { jobs }))
}

/// GET /jobs/:id/status
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = state.service.get_status(job_id).await?;
    Ok(Json(JobStatusResponse {
        job_id: job.id,
        job_type: job.job_type,
        status: job.status,
        parameters: job.parameters,
        created_at: job.created_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
        error: job.error,
        rerun_of: job.rerun_of,
    }))
}

/// GET /jobs/:id/log
pub async fn get_job_log(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobLogResponse>> {
    let lines = state.service.get_log(job_id).await?;
    Ok(Json(JobLogResponse { job_id, lines }))
}

/// GET /jobs/:id/results
///
/// 200 with the result once Completed; 409 carrying the current status (and
/// error, if Failed) otherwise.
pub async fn get_job_results(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Response> {
    let response = match state.service.get_results(job_id).await? {
        ResultsView::Ready(result) => Json(json!({
            "job_id": job_id,
            "ready": true,
            "result": result,
        }))
        .into_response(),
        ResultsView::NotReady { status, error } => (
            StatusCode::CONFLICT,
            Json(json!({
                "job_id": job_id,
                "ready": false,
                "status": status,
                "error": error,
            })),
        )
            .into_response(),
    };
    Ok(response)
}

/// GET /jobs/:id/files/:name
pub async fn download_file(
    State(state): State<AppState>,
    Path((job_id, name)): Path<(Uuid, String)>,
) -> ApiResult<Response> {
    let (file, bytes) = state.service.download(job_id, &name).await?;
    let content_type = if file.name.ends_with(".csv") {
        "text/csv; charset=utf-8"
    } else {
        "application/octet-stream"
    };
    let headers = [
        (header::CONTENT_TYPE, content_type.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.name),
        ),
    ];
    Ok((headers, bytes).into_response())
}

/// POST /jobs/:id/rerun
pub async fn rerun_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let response = state.service.rerun(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Build job routes
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/demo", post(submit_demo_job))
        .route("/jobs/:id/status", get(get_job_status))
        .route("/jobs/:id/log", get(get_job_log))
        .route("/jobs/:id/results", get(get_job_results))
        .route("/jobs/:id/files/:name", get(download_file))
        .route("/jobs/:id/rerun", post(rerun_job))
}
