//! Embedded Execution Engine
//!
//! In-process SQLite via rusqlite. Statements run on the blocking pool behind a
//! connection mutex; a cancelled or timed-out execution interrupts the running
//! statement through the connection's interrupt handle, and one still waiting
//! for the connection never starts.

use crate::config::EmbeddedConfig;
use crate::execution::engine::{
    EngineAdapter, EngineCapabilities, EngineError, EngineKind, TableColumn,
};
use crate::execution::result::{ResultColumn, ResultEnvelope};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Embedded execution engine
pub struct EmbeddedEngine {
    config: EmbeddedConfig,
    capabilities: EngineCapabilities,
    connection: Arc<Mutex<Option<Connection>>>,
    interrupt: Mutex<Option<Arc<InterruptHandle>>>,
    /// Id of the execution currently holding the connection (0 = idle)
    running: Arc<AtomicU64>,
    next_execution: AtomicU64,
    initialized: AtomicBool,
}

struct StatementOutput {
    columns: Vec<ResultColumn>,
    rows: Vec<Vec<serde_json::Value>>,
    affected: Option<u64>,
}

/// Cancels one execution if dropped while armed: a queued execution never
/// starts, a running one has its statement interrupted
struct InterruptOnDrop {
    handle: Option<Arc<InterruptHandle>>,
    running: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
    execution_id: u64,
    armed: bool,
}

impl InterruptOnDrop {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        if self.running.load(Ordering::SeqCst) == self.execution_id {
            if let Some(handle) = &self.handle {
                debug!("Interrupting embedded execution {}", self.execution_id);
                handle.interrupt();
            }
        }
    }
}

impl EmbeddedEngine {
    pub fn new(config: EmbeddedConfig) -> Self {
        Self {
            config,
            capabilities: EngineCapabilities::embedded(),
            connection: Arc::new(Mutex::new(None)),
            interrupt: Mutex::new(None),
            running: Arc::new(AtomicU64::new(0)),
            next_execution: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// In-memory engine with the given databases attached
    pub fn in_memory(databases: &[&str]) -> Self {
        Self::new(EmbeddedConfig {
            path: ":memory:".to_string(),
            databases: databases.iter().map(|d| d.to_string()).collect(),
        })
    }

    fn is_in_memory(&self) -> bool {
        self.config.path == ":memory:"
    }

    /// File backing an attached database
    fn attachment_path(&self, database: &str) -> String {
        if self.is_in_memory() {
            return ":memory:".to_string();
        }
        let main = Path::new(&self.config.path);
        let dir = main.parent().unwrap_or_else(|| Path::new("."));
        dir.join(format!("{}.db", database)).to_string_lossy().to_string()
    }

    fn open(&self) -> Result<Connection, EngineError> {
        let connection = if self.is_in_memory() {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = Path::new(&self.config.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        EngineError::Unavailable(format!("cannot create data directory: {}", e))
                    })?;
                }
            }
            Connection::open(&self.config.path)
        }
        .map_err(|e| EngineError::Unavailable(format!("failed to open database: {}", e)))?;

        for database in &self.config.databases {
            let attach = format!("ATTACH DATABASE ?1 AS \"{}\"", database);
            connection
                .execute(&attach, [self.attachment_path(database)])
                .map_err(|e| {
                    EngineError::Unavailable(format!("failed to attach '{}': {}", database, e))
                })?;
        }
        Ok(connection)
    }

    fn interrupt_handle(&self) -> Option<Arc<InterruptHandle>> {
        self.interrupt.lock().ok().and_then(|guard| guard.clone())
    }

    async fn run_blocking<T, F>(&self, timeout: Duration, work: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, EngineError> + Send + 'static,
    {
        let execution_id = self.next_execution.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = self.connection.clone();
        let running = self.running.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_flag = cancelled.clone();

        let task = tokio::task::spawn_blocking(move || {
            let guard = connection
                .lock()
                .map_err(|_| EngineError::Unavailable("connection lock poisoned".to_string()))?;
            let conn = guard.as_ref().ok_or_else(|| {
                EngineError::Unavailable("embedded engine is not initialized".to_string())
            })?;
            // Published before the flag check: a racing drop either sees this
            // execution running or has already set the flag
            running.store(execution_id, Ordering::SeqCst);
            if cancelled_flag.load(Ordering::SeqCst) {
                let _ =
                    running.compare_exchange(execution_id, 0, Ordering::SeqCst, Ordering::SeqCst);
                debug!("Embedded execution {} cancelled before it started", execution_id);
                return Err(EngineError::Cancelled(
                    "execution cancelled while waiting for the connection".to_string(),
                ));
            }
            let outcome = work(conn);
            let _ = running.compare_exchange(execution_id, 0, Ordering::SeqCst, Ordering::SeqCst);
            outcome
        });

        let mut interrupt_guard = InterruptOnDrop {
            handle: self.interrupt_handle(),
            running: self.running.clone(),
            cancelled,
            execution_id,
            armed: true,
        };

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(outcome)) => {
                interrupt_guard.disarm();
                outcome
            }
            Ok(Err(join_error)) => {
                interrupt_guard.disarm();
                Err(EngineError::Execution(format!(
                    "embedded worker failed: {}",
                    join_error
                )))
            }
            Err(_) => {
                warn!("Embedded execution {} timed out after {:?}", execution_id, timeout);
                Err(EngineError::Timeout(timeout))
            }
        }
    }
}

fn map_sqlite_error(err: rusqlite::Error) -> EngineError {
    if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
        return EngineError::Cancelled("statement interrupted".to_string());
    }
    EngineError::Execution(err.to_string())
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Blob(bytes) => serde_json::Value::String(hex::encode(bytes)),
    }
}

fn run_statement(conn: &Connection, sql: &str) -> Result<StatementOutput, EngineError> {
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;

    let columns: Vec<ResultColumn> = stmt
        .columns()
        .iter()
        .map(|c| ResultColumn {
            name: c.name().to_string(),
            data_type: c.decl_type().unwrap_or("ANY").to_string(),
        })
        .collect();

    if columns.is_empty() {
        let affected = stmt.execute([]).map_err(map_sqlite_error)?;
        return Ok(StatementOutput {
            columns,
            rows: Vec::new(),
            affected: Some(affected as u64),
        });
    }

    let column_count = columns.len();
    let mut rows = stmt.query([]).map_err(map_sqlite_error)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqlite_error)? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(value_to_json(row.get_ref(i).map_err(map_sqlite_error)?));
        }
        out.push(values);
    }

    Ok(StatementOutput {
        columns,
        rows: out,
        affected: None,
    })
}

fn read_table_info(
    conn: &Connection,
    database: &str,
    table: &str,
) -> Result<Vec<TableColumn>, EngineError> {
    let pragma = format!(
        "PRAGMA \"{}\".table_info(\"{}\")",
        database.replace('"', "\"\""),
        table.replace('"', "\"\"")
    );
    let mut stmt = conn.prepare(&pragma).map_err(map_sqlite_error)?;
    let columns = stmt
        .query_map([], |row| {
            let notnull: i64 = row.get(3)?;
            Ok(TableColumn {
                name: row.get(1)?,
                data_type: row.get(2)?,
                nullable: notnull == 0,
            })
        })
        .map_err(map_sqlite_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_sqlite_error)?;

    if columns.is_empty() {
        return Err(EngineError::Execution(format!(
            "table {}.{} does not exist",
            database, table
        )));
    }
    Ok(columns)
}

#[async_trait]
impl EngineAdapter for EmbeddedEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Embedded
    }

    fn capabilities(&self) -> &EngineCapabilities {
        &self.capabilities
    }

    async fn initialize(&self) -> Result<(), EngineError> {
        let connection = self.open()?;
        let handle = Arc::new(connection.get_interrupt_handle());

        {
            let mut guard = self
                .connection
                .lock()
                .map_err(|_| EngineError::Unavailable("connection lock poisoned".to_string()))?;
            *guard = Some(connection);
        }
        if let Ok(mut guard) = self.interrupt.lock() {
            *guard = Some(handle);
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(
            "Embedded engine initialized at {} with databases {:?}",
            self.config.path, self.config.databases
        );
        Ok(())
    }

    async fn execute(&self, sql: &str, timeout: Duration) -> Result<ResultEnvelope, EngineError> {
        let start_time = Instant::now();
        let sql_owned = sql.to_string();
        debug!("Executing on embedded engine: {}", sql);

        let output = self
            .run_blocking(timeout, move |conn| run_statement(conn, &sql_owned))
            .await?;

        let execution_time_ms = start_time.elapsed().as_millis() as u64;
        let envelope = match output.affected {
            Some(affected) => {
                ResultEnvelope::affected(EngineKind::Embedded, affected, execution_time_ms)
            }
            None => ResultEnvelope::with_rows(
                EngineKind::Embedded,
                output.columns,
                output.rows,
                execution_time_ms,
            ),
        };
        Ok(envelope.with_metric("backend", "sqlite"))
    }

    async fn health_check(&self) -> bool {
        if !self.initialized.load(Ordering::SeqCst) {
            return false;
        }
        match self.connection.try_lock() {
            Ok(guard) => guard
                .as_ref()
                .map(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok())
                .unwrap_or(false),
            // A statement is running, so the connection is alive
            Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Poisoned(_)) => false,
        }
    }

    async fn describe_table(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<TableColumn>, EngineError> {
        let database = database.to_string();
        let table = table.to_string();
        self.run_blocking(Duration::from_secs(30), move |conn| {
            read_table_info(conn, &database, &table)
        })
        .await
    }

    async fn shutdown(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.interrupt.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.connection.lock() {
            guard.take();
        }
        info!("Embedded engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> EmbeddedEngine {
        let engine = EmbeddedEngine::in_memory(&["bigquery_lite"]);
        engine.initialize().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_query_returns_rows() {
        let engine = engine().await;
        let result = engine
            .execute("SELECT 1 AS one, 'a' AS letter", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.row_count, 1);
        assert_eq!(result.columns[0].name, "one");
        assert_eq!(result.rows[0][0], serde_json::json!(1));
        assert_eq!(result.rows[0][1], serde_json::json!("a"));
    }

    #[tokio::test]
    async fn test_ddl_insert_and_describe() {
        let engine = engine().await;
        let timeout = Duration::from_secs(5);
        engine
            .execute(
                "CREATE TABLE \"bigquery_lite\".\"events\" \
                 (\"id\" INTEGER NOT NULL, \"name\" TEXT)",
                timeout,
            )
            .await
            .unwrap();

        let inserted = engine
            .execute(
                "INSERT INTO \"bigquery_lite\".\"events\" (\"id\", \"name\") \
                 VALUES (1, 'x'), (2, NULL)",
                timeout,
            )
            .await
            .unwrap();
        assert_eq!(inserted.row_count, 2);

        let columns = engine.describe_table("bigquery_lite", "events").await.unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].data_type, "INTEGER");
        assert!(!columns[0].nullable);
        assert!(columns[1].nullable);

        let rows = engine
            .execute("SELECT name FROM bigquery_lite.events ORDER BY id", timeout)
            .await
            .unwrap();
        assert_eq!(rows.rows, vec![vec![serde_json::json!("x")], vec![serde_json::Value::Null]]);
    }

    #[tokio::test]
    async fn test_invalid_sql_is_execution_error() {
        let engine = engine().await;
        let err = engine
            .execute("SELEC nonsense", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    #[tokio::test]
    async fn test_uninitialized_engine_is_unhealthy() {
        let engine = EmbeddedEngine::in_memory(&[]);
        assert!(!engine.health_check().await);
        let err = engine.execute("SELECT 1", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));

        engine.initialize().await.unwrap();
        assert!(engine.health_check().await);
        engine.shutdown().await;
        assert!(!engine.health_check().await);
    }

    #[tokio::test]
    async fn test_long_statement_times_out() {
        let engine = engine().await;
        let sql = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                   SELECT count(*) FROM c";
        let err = engine.execute(sql, Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));

        // The interrupted statement releases the connection
        tokio::time::sleep(Duration::from_millis(200)).await;
        let ok = engine.execute("SELECT 2", Duration::from_secs(5)).await.unwrap();
        assert_eq!(ok.rows[0][0], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_timed_out_statement_waiting_for_connection_never_runs() {
        let engine = Arc::new(engine().await);
        let timeout = Duration::from_secs(5);
        engine
            .execute("CREATE TABLE bigquery_lite.t (x INTEGER)", timeout)
            .await
            .unwrap();

        let blocker = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let sql = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                           SELECT count(*) FROM c";
                engine.execute(sql, Duration::from_millis(500)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = engine
            .execute("INSERT INTO bigquery_lite.t VALUES (42)", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));

        assert!(matches!(blocker.await.unwrap(), Err(EngineError::Timeout(_))));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let rows = engine
            .execute("SELECT count(*) FROM bigquery_lite.t", timeout)
            .await
            .unwrap();
        assert_eq!(rows.rows, vec![vec![serde_json::json!(0)]]);
    }
}
