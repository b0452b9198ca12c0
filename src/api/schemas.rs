use crate::api::{ApiError, ApiJson, ApiQuery, ApiResult};
use crate::app::AppState;
use crate::error::BqError;
use crate::execution::EngineKind;
use crate::ingestion::{IngestRequest, IngestionOutcome};
use crate::schema::{
    create_tables as provision, CompatibilityReport, Registration, SchemaSummary, SchemaVersion,
    TableCreationResult, TableDdl, TranslateMode,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(alias = "schema")]
    pub source_definition: String,
    pub table_name: String,
    pub database_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DdlParams {
    pub engine: EngineKind,
    pub mode: Option<TranslateMode>,
    #[serde(default)]
    pub if_not_exists: bool,
}

#[derive(Debug, Deserialize)]
pub struct EngineParam {
    pub engine: EngineKind,
}

#[derive(Debug, Serialize)]
pub struct FlattenedViewResponse {
    pub schema_id: String,
    pub engine: EngineKind,
    pub sql: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompatibilityParams {
    /// Older schema id to compare against
    pub against: String,
}

fn default_if_not_exists() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CreateTablesRequest {
    pub engines: Vec<EngineKind>,
    #[serde(default = "default_if_not_exists")]
    pub if_not_exists: bool,
    pub mode: Option<TranslateMode>,
}

#[derive(Debug, Deserialize)]
pub struct IngestParams {
    pub engine: EngineKind,
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub create_table: bool,
}

#[derive(Debug, Serialize)]
pub struct DeregisterResponse {
    pub database_name: String,
    pub table_name: String,
    pub deregistered: bool,
}

pub async fn register(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<RegisterRequest>,
) -> ApiResult<Registration> {
    let registration = state.registry.register(
        &request.source_definition,
        &request.table_name,
        request.database_name.as_deref(),
    )?;
    Ok(Json(registration))
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<SchemaSummary>> {
    Json(state.registry.list())
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SchemaVersion> {
    Ok(Json(state.registry.get(&id)?.as_ref().clone()))
}

pub async fn versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<SchemaVersion>> {
    let versions = state.registry.versions_for_schema(&id)?;
    Ok(Json(versions.iter().map(|v| v.as_ref().clone()).collect()))
}

/// Retire the logical schema the given version belongs to
pub async fn deregister(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DeregisterResponse> {
    let version = state.registry.get(&id)?;
    state
        .registry
        .deregister(&version.database_name, &version.table_name)?;
    Ok(Json(DeregisterResponse {
        database_name: version.database_name.clone(),
        table_name: version.table_name.clone(),
        deregistered: true,
    }))
}

pub async fn ddl(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiQuery(params): ApiQuery<DdlParams>,
) -> ApiResult<TableDdl> {
    let mode = params
        .mode
        .unwrap_or_else(|| state.registry.mode_for(&id, params.engine));
    Ok(Json(state.registry.translate(
        &id,
        params.engine,
        Some(mode),
        params.if_not_exists,
    )?))
}

pub async fn flattened_view(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiQuery(params): ApiQuery<EngineParam>,
) -> ApiResult<FlattenedViewResponse> {
    let sql = state.registry.flattened_view_sql(&id, params.engine)?;
    Ok(Json(FlattenedViewResponse {
        schema_id: id,
        engine: params.engine,
        sql,
    }))
}

pub async fn compatibility(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiQuery(params): ApiQuery<CompatibilityParams>,
) -> ApiResult<CompatibilityReport> {
    Ok(Json(state.registry.check_compatibility(&params.against, &id)?))
}

pub async fn create_tables(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<CreateTablesRequest>,
) -> ApiResult<BTreeMap<EngineKind, TableCreationResult>> {
    if request.engines.is_empty() {
        return Err(ApiError(BqError::InvalidRequest(
            "engines must name at least one engine".to_string(),
        )));
    }
    let results = provision(
        &state.registry,
        &state.jobs,
        &id,
        &request.engines,
        request.if_not_exists,
        request.mode,
    )
    .await?;
    Ok(Json(results))
}

pub async fn ingest(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiQuery(params): ApiQuery<IngestParams>,
    body: Bytes,
) -> ApiResult<IngestionOutcome> {
    let mut request = IngestRequest::new(id, params.engine);
    request.batch_size = params.batch_size;
    request.create_table_if_not_exists = params.create_table;
    Ok(Json(state.ingestion.ingest(&body, &request).await?))
}
