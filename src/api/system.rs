use crate::api::{ApiError, ApiResult};
use crate::app::AppState;
use crate::execution::EngineKind;
use crate::jobs::SchedulerStats;
use axum::{extract::State, response::Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub engines: BTreeMap<EngineKind, bool>,
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub engines: BTreeMap<EngineKind, bool>,
    pub fallbacks: BTreeMap<EngineKind, EngineKind>,
    pub scheduler: SchedulerStats,
    pub schemas: usize,
    pub metadata_store: String,
}

/// Healthy when every engine is, degraded otherwise
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engines = state.router.health().await;
    let status = if engines.values().all(|healthy| *healthy) {
        "healthy"
    } else {
        "degraded"
    };
    Json(HealthResponse { status, engines })
}

pub async fn status(State(state): State<AppState>) -> ApiResult<SystemStatus> {
    let scheduler = state.jobs.stats().await.map_err(ApiError)?;
    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        engines: state.router.health().await,
        fallbacks: EngineKind::ALL
            .iter()
            .filter_map(|engine| state.router.fallback_for(*engine).map(|to| (*engine, to)))
            .collect(),
        scheduler,
        schemas: state.registry.list().len(),
        metadata_store: state.store.describe(),
    }))
}
