use crate::api::{ApiError, ApiJson, ApiQuery, ApiResult};
use crate::app::AppState;
use crate::execution::{validate_sql, EngineKind, ResultEnvelope, ValidationReport};
use crate::jobs::{JobFilter, JobInfo, JobRequest, JobState};
use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_LIST_LIMIT: usize = 100;

fn default_engine() -> EngineKind {
    EngineKind::Embedded
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub sql: String,
    #[serde(default = "default_engine")]
    pub engine: EngineKind,
    pub priority: Option<u8>,
    pub estimated_slots: Option<u32>,
    /// Seconds
    pub max_execution_time: Option<u64>,
    #[serde(default)]
    pub disable_fallback: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: JobState,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: String,
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub sql: String,
    #[serde(default = "default_engine")]
    pub engine: EngineKind,
}

pub async fn submit(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SubmitJobRequest>,
) -> ApiResult<SubmitJobResponse> {
    let mut job = JobRequest::query(request.sql, request.engine);
    if let Some(priority) = request.priority {
        job = job.with_priority(priority);
    }
    if let Some(slots) = request.estimated_slots {
        job = job.with_slots(slots);
    }
    if let Some(secs) = request.max_execution_time {
        job = job.with_timeout(Duration::from_secs(secs));
    }
    if request.disable_fallback {
        job = job.without_fallback();
    }

    let job_id = state.jobs.submit(job).await?;
    Ok(Json(SubmitJobResponse {
        job_id,
        status: JobState::Queued,
    }))
}

pub async fn list(
    State(state): State<AppState>,
    ApiQuery(mut filter): ApiQuery<JobFilter>,
) -> ApiResult<Vec<JobInfo>> {
    filter.limit = Some(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT));
    Ok(Json(state.jobs.list(filter).await?))
}

pub async fn status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<JobInfo> {
    Ok(Json(state.jobs.get_status(&id).await?))
}

pub async fn result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ResultEnvelope> {
    Ok(Json(state.jobs.get_result(&id).await?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<CancelResponse> {
    let cancelled = state.jobs.cancel(&id).await.map_err(ApiError)?;
    Ok(Json(CancelResponse { job_id: id, cancelled }))
}

pub async fn history(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<HistoryParams>,
) -> ApiResult<Vec<JobInfo>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(state.jobs.history(limit).await?))
}

pub async fn validate(ApiJson(request): ApiJson<ValidateRequest>) -> Json<ValidationReport> {
    Json(validate_sql(&request.sql, request.engine))
}
