//! Result Envelope - Uniform result format from every engine

use crate::execution::engine::EngineKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Column of a result set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    pub data_type: String,
}

/// Standardized result returned by any engine adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Ordered result columns (empty for DDL and inserts)
    pub columns: Vec<ResultColumn>,

    /// Ordered rows of ordered values
    pub rows: Vec<Vec<serde_json::Value>>,

    /// Rows returned, or rows written for statements without a result set
    pub row_count: u64,

    /// Execution time in milliseconds
    pub execution_time_ms: u64,

    /// Engine that actually executed the statement
    pub engine: EngineKind,

    /// Set when the router executed on the fallback engine
    #[serde(default)]
    pub fallback_used: bool,

    /// Engine-specific metrics
    #[serde(default)]
    pub engine_metrics: HashMap<String, serde_json::Value>,
}

impl ResultEnvelope {
    /// Result of a statement that returned rows
    pub fn with_rows(
        engine: EngineKind,
        columns: Vec<ResultColumn>,
        rows: Vec<Vec<serde_json::Value>>,
        execution_time_ms: u64,
    ) -> Self {
        let row_count = rows.len() as u64;
        Self {
            columns,
            rows,
            row_count,
            execution_time_ms,
            engine,
            fallback_used: false,
            engine_metrics: HashMap::new(),
        }
    }

    /// Result of a statement without a result set
    pub fn affected(engine: EngineKind, affected_rows: u64, execution_time_ms: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: affected_rows,
            execution_time_ms,
            engine,
            fallback_used: false,
            engine_metrics: HashMap::new(),
        }
    }

    pub fn with_metric(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.engine_metrics.insert(key.to_string(), value.into());
        self
    }

    /// Column index by name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}
