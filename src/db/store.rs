use crate::error::{BqError, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

/// SQLite-backed metadata store
pub struct MetadataStore {
    /// Database file, None for an in-memory store
    path: Option<PathBuf>,

    db: Mutex<Connection>,
}

impl MetadataStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Connection::open(&path)
            .map_err(|e| BqError::Database(format!("Failed to open {}: {}", path.display(), e)))?;

        let store = Self {
            path: Some(path),
            db: Mutex::new(db),
        };
        store.init_schema()?;

        info!("Metadata store opened at {}", store.describe());
        Ok(store)
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()
            .map_err(|e| BqError::Database(format!("Failed to open in-memory store: {}", e)))?;
        let store = Self {
            path: None,
            db: Mutex::new(db),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn describe(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        }
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| BqError::Database("metadata store lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.conn()?;

        db.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS job_history (
                job_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                sql_text TEXT NOT NULL,
                engine TEXT NOT NULL,
                priority INTEGER NOT NULL,
                estimated_slots INTEGER NOT NULL,
                max_execution_time_secs INTEGER NOT NULL,
                state TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                error TEXT,
                row_count INTEGER,
                execution_time_ms INTEGER,
                executed_engine TEXT,
                fallback_used INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_job_history_submitted
                ON job_history(submitted_at);

            CREATE TABLE IF NOT EXISTS schema_versions (
                schema_id TEXT PRIMARY KEY,
                database_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                fields TEXT NOT NULL,
                source_definition TEXT NOT NULL,
                source_format TEXT NOT NULL,
                root_message TEXT,
                previous_schema_id TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(database_name, table_name, version)
            );

            CREATE TABLE IF NOT EXISTS schemas (
                database_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                current_schema_id TEXT NOT NULL REFERENCES schema_versions(schema_id),
                retired INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (database_name, table_name)
            );

            CREATE TABLE IF NOT EXISTS engine_table_bindings (
                schema_id TEXT NOT NULL REFERENCES schema_versions(schema_id),
                engine TEXT NOT NULL,
                mode TEXT NOT NULL,
                ddl TEXT NOT NULL,
                created INTEGER NOT NULL,
                error TEXT,
                job_id TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (schema_id, engine)
            );
            "#,
        )
        .map_err(|e| BqError::Database(format!("Failed to create metadata tables: {}", e)))?;

        Ok(())
    }
}

/// Fixed-width RFC 3339 text, so stored timestamps sort lexically
pub(crate) fn format_timestamp(value: &chrono::DateTime<chrono::Utc>) -> String {
    value.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| BqError::Database(format!("Invalid stored timestamp '{}': {}", value, e)))
}
