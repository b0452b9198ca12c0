//! HTTP API
//!
//! JSON over axum. Every handler returns `ApiResult`, so failures leave as
//! `{ "error": KIND, "message": text }` with a status derived from the kind.

mod extract;
mod jobs;
mod schemas;
mod system;

use crate::app::AppState;
use crate::error::{BqError, ErrorKind};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

/// Error body of every failed request
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorKind,
    pub message: String,
}

/// Handler error wrapping the crate error
#[derive(Debug)]
pub struct ApiError(pub BqError);

impl From<BqError> for ApiError {
    fn from(err: BqError) -> Self {
        ApiError(err)
    }
}

pub use extract::{ApiJson, ApiQuery};

pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest | ErrorKind::SchemaValidationFailed => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::NotReady | ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::EngineUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Execution | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: kind,
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(system::health))
        .route("/system/status", get(system::status))
        .route("/jobs", post(jobs::submit).get(jobs::list))
        .route("/jobs/:id", get(jobs::status))
        .route("/jobs/:id/result", get(jobs::result))
        .route("/jobs/:id/cancel", post(jobs::cancel))
        .route("/history", get(jobs::history))
        .route("/queries/validate", post(jobs::validate))
        .route("/schemas", post(schemas::register).get(schemas::list))
        .route("/schemas/:id", get(schemas::get).delete(schemas::deregister))
        .route("/schemas/:id/versions", get(schemas::versions))
        .route("/schemas/:id/ddl", get(schemas::ddl))
        .route("/schemas/:id/flattened-view", get(schemas::flattened_view))
        .route("/schemas/:id/compatibility", get(schemas::compatibility))
        .route("/schemas/:id/tables", post(schemas::create_tables))
        .route("/schemas/:id/ingest", post(schemas::ingest))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn serve(bind: &str, state: AppState) -> crate::error::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("API listening on http://{}", bind);
    axum::serve(listener, app).await?;
    Ok(())
}
