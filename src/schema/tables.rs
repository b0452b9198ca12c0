//! Table provisioning
//!
//! DDL runs as ordinary jobs (fallback disabled, the SQL is engine specific).
//! Each engine succeeds or fails on its own; nothing is rolled back.

use crate::error::Result;
use crate::execution::EngineKind;
use crate::jobs::{JobId, JobManager, JobRequest, JobState};
use crate::schema::registry::{EngineTableBinding, SchemaRegistry};
use crate::schema::translator::TranslateMode;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Outcome of provisioning one engine
#[derive(Debug, Clone, Serialize)]
pub struct TableCreationResult {
    pub engine: EngineKind,
    pub success: bool,
    pub mode: TranslateMode,
    pub ddl: Option<String>,
    pub job_id: Option<JobId>,
    pub error: Option<String>,
    /// Flattened view created next to a nested table
    pub view_sql: Option<String>,
    pub view_error: Option<String>,
}

impl TableCreationResult {
    fn failed(engine: EngineKind, mode: TranslateMode, error: String) -> Self {
        Self {
            engine,
            success: false,
            mode,
            ddl: None,
            job_id: None,
            error: Some(error),
            view_sql: None,
            view_error: None,
        }
    }
}

/// Run `sql` as a job and wait for it; Err carries the failure text
async fn run_ddl(
    jobs: &JobManager,
    sql: &str,
    engine: EngineKind,
) -> (Option<JobId>, std::result::Result<(), String>) {
    let job_id = match jobs.submit(JobRequest::query(sql, engine).without_fallback()).await {
        Ok(job_id) => job_id,
        Err(e) => return (None, Err(e.to_string())),
    };
    let outcome = match jobs.wait(&job_id).await {
        Ok(info) if info.state == JobState::Completed => Ok(()),
        Ok(info) => Err(info
            .error
            .map(|e| e.message)
            .unwrap_or_else(|| format!("job ended {}", info.state))),
        Err(e) => Err(e.to_string()),
    };
    (Some(job_id), outcome)
}

async fn create_on_engine(
    registry: &SchemaRegistry,
    jobs: &JobManager,
    schema_id: &str,
    engine: EngineKind,
    if_not_exists: bool,
    mode: TranslateMode,
) -> TableCreationResult {
    let table = match registry.translate(schema_id, engine, Some(mode), if_not_exists) {
        Ok(table) => table,
        Err(e) => return TableCreationResult::failed(engine, mode, e.to_string()),
    };

    let (job_id, outcome) = run_ddl(jobs, &table.ddl, engine).await;
    let mut result = TableCreationResult {
        engine,
        success: outcome.is_ok(),
        mode,
        ddl: Some(table.ddl.clone()),
        job_id: job_id.clone(),
        error: outcome.err(),
        view_sql: None,
        view_error: None,
    };

    if result.success && mode == TranslateMode::Nested {
        match registry.flattened_view_sql(schema_id, engine) {
            Ok(Some(view_sql)) => {
                if let (_, Err(e)) = run_ddl(jobs, &view_sql, engine).await {
                    warn!("Flattened view for {} on {} failed: {}", schema_id, engine, e);
                    result.view_error = Some(e);
                }
                result.view_sql = Some(view_sql);
            }
            Ok(None) => {}
            Err(e) => result.view_error = Some(e.to_string()),
        }
    }

    let binding = EngineTableBinding {
        schema_id: schema_id.to_string(),
        engine,
        mode,
        ddl: table.ddl,
        created: result.success,
        error: result.error.clone(),
        job_id,
        updated_at: Utc::now(),
    };
    if let Err(e) = registry.record_binding(binding) {
        warn!("Failed to record table binding for {} on {}: {}", schema_id, engine, e);
    }

    match &result.error {
        None => info!("Created table for schema {} on {} ({})", schema_id, engine, mode.as_str()),
        Some(e) => warn!("Table creation for schema {} on {} failed: {}", schema_id, engine, e),
    }
    result
}

/// Provision a registered schema on each engine
///
/// Fails only when the schema is unknown; per-engine failures are reported in
/// the returned map.
pub async fn create_tables(
    registry: &SchemaRegistry,
    jobs: &JobManager,
    schema_id: &str,
    engines: &[EngineKind],
    if_not_exists: bool,
    mode: Option<TranslateMode>,
) -> Result<BTreeMap<EngineKind, TableCreationResult>> {
    registry.get(schema_id)?;

    let mut results = BTreeMap::new();
    for engine in engines {
        if results.contains_key(engine) {
            continue;
        }
        let mode = mode.unwrap_or_else(|| registry.mode_for(schema_id, *engine));
        let result =
            create_on_engine(registry, jobs, schema_id, *engine, if_not_exists, mode).await;
        results.insert(*engine, result);
    }
    Ok(results)
}
