use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BqError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Schema validation failed: {0}")]
    SchemaValidationFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BqError {
    /// Taxonomy kind of this error, as stored on jobs and reported by the API
    pub fn kind(&self) -> ErrorKind {
        match self {
            BqError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            BqError::EngineUnavailable(_) => ErrorKind::EngineUnavailable,
            BqError::Timeout(_) => ErrorKind::Timeout,
            BqError::SchemaValidationFailed(_) => ErrorKind::SchemaValidationFailed,
            BqError::NotFound(_) => ErrorKind::NotFound,
            BqError::NotReady(_) => ErrorKind::NotReady,
            BqError::Execution(_) => ErrorKind::Execution,
            BqError::Cancelled(_) => ErrorKind::Cancelled,
            BqError::Database(_) | BqError::Config(_) | BqError::Io(_) | BqError::Json(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<rusqlite::Error> for BqError {
    fn from(err: rusqlite::Error) -> Self {
        BqError::Database(err.to_string())
    }
}

/// Error taxonomy shared by jobs, the API and persisted history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidRequest,
    EngineUnavailable,
    Timeout,
    SchemaValidationFailed,
    NotFound,
    NotReady,
    Execution,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::EngineUnavailable => "ENGINE_UNAVAILABLE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::SchemaValidationFailed => "SCHEMA_VALIDATION_FAILED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::NotReady => "NOT_READY",
            ErrorKind::Execution => "EXECUTION",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let kind = match value {
            "INVALID_REQUEST" => ErrorKind::InvalidRequest,
            "ENGINE_UNAVAILABLE" => ErrorKind::EngineUnavailable,
            "TIMEOUT" => ErrorKind::Timeout,
            "SCHEMA_VALIDATION_FAILED" => ErrorKind::SchemaValidationFailed,
            "NOT_FOUND" => ErrorKind::NotFound,
            "NOT_READY" => ErrorKind::NotReady,
            "EXECUTION" => ErrorKind::Execution,
            "CANCELLED" => ErrorKind::Cancelled,
            "INTERNAL" => ErrorKind::Internal,
            _ => return None,
        };
        Some(kind)
    }
}

pub type Result<T> = std::result::Result<T, BqError>;
