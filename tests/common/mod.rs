#![allow(dead_code)]

use async_trait::async_trait;
use bqlite::config::{AppConfig, SchedulerConfig};
use bqlite::db::MetadataStore;
use bqlite::execution::{
    EngineAdapter, EngineCapabilities, EngineError, EngineKind, QueryRouter, ResultColumn,
    ResultEnvelope, TableColumn,
};
use bqlite::jobs::JobManager;
use bqlite::AppState;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scriptable engine for scheduler and router tests
///
/// `SLEEP <ms>` sleeps before answering, `FAIL <text>` fails with an
/// execution error. Anything else returns one row echoing the statement.
pub struct MockEngine {
    kind: EngineKind,
    capabilities: EngineCapabilities,
    healthy: AtomicBool,
    started: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl MockEngine {
    pub fn new(kind: EngineKind) -> Arc<Self> {
        let capabilities = match kind {
            EngineKind::Embedded => EngineCapabilities::embedded(),
            EngineKind::Distributed => EngineCapabilities::distributed(),
        };
        Arc::new(Self {
            kind,
            capabilities,
            healthy: AtomicBool::new(true),
            started: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }

    pub fn unhealthy(kind: EngineKind) -> Arc<Self> {
        let engine = Self::new(kind);
        engine.set_healthy(false);
        engine
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Statements in the order execution started
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Highest number of statements seen running at once
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineAdapter for MockEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn capabilities(&self) -> &EngineCapabilities {
        &self.capabilities
    }

    async fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn execute(&self, sql: &str, _timeout: Duration) -> Result<ResultEnvelope, EngineError> {
        self.started.lock().unwrap().push(sql.to_string());
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        if let Some(ms) = sql.strip_prefix("SLEEP ") {
            let ms: u64 = ms.trim().parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(message) = sql.strip_prefix("FAIL ") {
            return Err(EngineError::Execution(message.to_string()));
        }

        Ok(ResultEnvelope::with_rows(
            self.kind,
            vec![ResultColumn {
                name: "sql".to_string(),
                data_type: "String".to_string(),
            }],
            vec![vec![serde_json::Value::String(sql.to_string())]],
            1,
        ))
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn describe_table(
        &self,
        _database: &str,
        table: &str,
    ) -> Result<Vec<TableColumn>, EngineError> {
        Err(EngineError::Execution(format!("table {} does not exist", table)))
    }

    async fn shutdown(&self) {
        self.set_healthy(false);
    }
}

pub fn scheduler_config(total_slots: u32) -> SchedulerConfig {
    SchedulerConfig {
        total_slots,
        ..SchedulerConfig::default()
    }
}

/// Router over one healthy mock of each engine
pub fn mock_router() -> (Arc<QueryRouter>, Arc<MockEngine>, Arc<MockEngine>) {
    let embedded = MockEngine::new(EngineKind::Embedded);
    let distributed = MockEngine::new(EngineKind::Distributed);
    let router = QueryRouter::new()
        .with_engine(embedded.clone())
        .with_engine(distributed.clone())
        .with_fallback(EngineKind::Distributed, EngineKind::Embedded);
    (Arc::new(router), embedded, distributed)
}

pub fn job_manager(config: SchedulerConfig) -> (JobManager, Arc<MockEngine>, Arc<MockEngine>) {
    let (router, embedded, distributed) = mock_router();
    (JobManager::start(config, router, None), embedded, distributed)
}

/// Full application state over the given router and an in-memory store
pub fn app_state(router: Arc<QueryRouter>) -> AppState {
    let store = Arc::new(MetadataStore::in_memory().unwrap());
    AppState::from_parts(AppConfig::default(), router, store).unwrap()
}

// Protobuf wire encoding for building payloads

pub fn put_varint_field(buf: &mut Vec<u8>, tag: u32, value: u64) {
    prost::encoding::encode_key(tag, prost::encoding::WireType::Varint, buf);
    prost::encoding::encode_varint(value, buf);
}

pub fn put_bytes_field(buf: &mut Vec<u8>, tag: u32, bytes: &[u8]) {
    prost::encoding::encode_key(tag, prost::encoding::WireType::LengthDelimited, buf);
    prost::encoding::encode_varint(bytes.len() as u64, buf);
    buf.extend_from_slice(bytes);
}

/// Concatenate messages, each prefixed with its varint length
pub fn length_delimited(messages: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = Vec::new();
    for message in messages {
        prost::encoding::encode_varint(message.len() as u64, &mut payload);
        payload.extend_from_slice(message);
    }
    payload
}
