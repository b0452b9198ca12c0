//! Engine Adapter Trait - Core contract for the execution backends
//!
//! Every backend (embedded, distributed) is wrapped in an adapter exposing the
//! same lifecycle and execution contract. Adapters never reference each other;
//! failover between them lives in the router only.

use crate::execution::result::ResultEnvelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// The closed set of execution engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// In-process engine
    Embedded,
    /// Remote columnar cluster
    Distributed,
}

impl EngineKind {
    pub const ALL: [EngineKind; 2] = [EngineKind::Embedded, EngineKind::Distributed];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Embedded => "embedded",
            EngineKind::Distributed => "distributed",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "embedded" | "sqlite" => Ok(EngineKind::Embedded),
            "distributed" | "clickhouse" => Ok(EngineKind::Distributed),
            other => Err(format!(
                "unknown engine '{}' (expected 'embedded' or 'distributed')",
                other
            )),
        }
    }
}

/// Engine capabilities - what composite types an engine stores natively
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Native struct/tuple columns
    pub supports_nested_types: bool,

    /// Native array columns
    pub supports_arrays: bool,

    /// Statements can be aborted while running
    pub supports_cancellation: bool,
}

impl EngineCapabilities {
    /// Embedded engine capabilities
    pub fn embedded() -> Self {
        Self {
            supports_nested_types: false,
            supports_arrays: false,
            supports_cancellation: true,
        }
    }

    /// Distributed engine capabilities
    pub fn distributed() -> Self {
        Self {
            supports_nested_types: true,
            supports_arrays: true,
            supports_cancellation: true,
        }
    }
}

/// Column as reported by table introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Errors raised by an adapter
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Engine adapter trait - all backends implement this
///
/// Implementations must be safe for concurrent `execute` calls.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Which engine this adapter wraps
    fn kind(&self) -> EngineKind;

    /// Engine capabilities
    fn capabilities(&self) -> &EngineCapabilities;

    /// Open connections and prepare configured databases
    async fn initialize(&self) -> Result<(), EngineError>;

    /// Execute one SQL statement
    async fn execute(&self, sql: &str, timeout: Duration) -> Result<ResultEnvelope, EngineError>;

    /// Check if the engine is reachable and usable
    async fn health_check(&self) -> bool;

    /// Introspect the columns of an existing table
    async fn describe_table(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<TableColumn>, EngineError>;

    /// Release connections
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_parsing() {
        assert_eq!("embedded".parse::<EngineKind>(), Ok(EngineKind::Embedded));
        assert_eq!("ClickHouse".parse::<EngineKind>(), Ok(EngineKind::Distributed));
        assert!("duckdb2".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_engine_kind_serde() {
        let json = serde_json::to_string(&EngineKind::Distributed).unwrap();
        assert_eq!(json, "\"distributed\"");
        let kind: EngineKind = serde_json::from_str("\"embedded\"").unwrap();
        assert_eq!(kind, EngineKind::Embedded);
    }
}
