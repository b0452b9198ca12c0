//! Distributed Execution Engine
//!
//! ClickHouse over its HTTP interface. Every execution carries its own
//! `query_id`; an execution dropped before the server answered (job
//! cancellation or timeout) issues a best-effort `KILL QUERY` for that id.

use crate::config::DistributedConfig;
use crate::execution::engine::{
    EngineAdapter, EngineCapabilities, EngineError, EngineKind, TableColumn,
};
use crate::execution::result::{ResultColumn, ResultEnvelope};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SUMMARY_HEADER: &str = "X-ClickHouse-Summary";

/// Distributed execution engine
pub struct DistributedEngine {
    config: DistributedConfig,
    capabilities: EngineCapabilities,
    client: Client,
    base_url: String,
    initialized: AtomicBool,
}

// ClickHouse JSONCompact output:
// {"meta":[{"name":..,"type":..}],"data":[[..]],"rows":N,"statistics":{..}}

#[derive(Debug, Deserialize)]
struct CompactResponse {
    meta: Vec<CompactColumn>,
    data: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    rows: Option<u64>,
    #[serde(default)]
    statistics: Option<CompactStatistics>,
}

#[derive(Debug, Deserialize)]
struct CompactColumn {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

#[derive(Debug, Deserialize)]
struct CompactStatistics {
    #[serde(default)]
    elapsed: f64,
    #[serde(default)]
    rows_read: u64,
    #[serde(default)]
    bytes_read: u64,
}

/// Issues `KILL QUERY` for its query id if dropped while armed
struct KillOnDrop {
    client: Client,
    base_url: String,
    user: String,
    password: String,
    query_id: String,
    armed: bool,
}

impl KillOnDrop {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.client.clone();
        let url = self.base_url.clone();
        let user = self.user.clone();
        let password = self.password.clone();
        let query_id = self.query_id.clone();
        runtime.spawn(async move {
            let sql = format!(
                "KILL QUERY WHERE query_id = '{}' ASYNC",
                query_id.replace('\'', "")
            );
            let outcome = client
                .post(&url)
                .header("X-ClickHouse-User", user)
                .header("X-ClickHouse-Key", password)
                .timeout(Duration::from_secs(5))
                .body(sql)
                .send()
                .await;
            match outcome {
                Ok(_) => debug!("Sent KILL QUERY for {}", query_id),
                Err(e) => warn!("Failed to kill query {}: {}", query_id, e),
            }
        });
    }
}

impl DistributedEngine {
    /// Create a new distributed engine
    pub fn new(config: DistributedConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| EngineError::Connection(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            config,
            capabilities: EngineCapabilities::distributed(),
            client,
            initialized: AtomicBool::new(false),
        })
    }

    fn request(&self, sql: &str, query_id: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let max_execution_time = timeout.as_secs().max(1).to_string();
        self.client
            .post(&self.base_url)
            .query(&[
                ("default_format", "JSONCompact"),
                ("query_id", query_id),
                ("max_execution_time", max_execution_time.as_str()),
                ("output_format_json_quote_64bit_integers", "0"),
            ])
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .timeout(timeout)
            .body(sql.to_string())
    }

    /// Send one statement, returning the summary header and raw body
    async fn post_statement(
        &self,
        sql: &str,
        timeout: Duration,
    ) -> Result<(HashMap<String, String>, String), EngineError> {
        let query_id = uuid::Uuid::new_v4().to_string();
        let mut kill_guard = KillOnDrop {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            user: self.config.user.clone(),
            password: self.config.password.clone(),
            query_id: query_id.clone(),
            armed: true,
        };

        let response = self
            .request(sql, &query_id, timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        let status = response.status();
        let summary = response
            .headers()
            .get(SUMMARY_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| serde_json::from_str::<HashMap<String, serde_json::Value>>(v).ok())
            .map(|m| {
                m.into_iter()
                    .map(|(k, v)| match v {
                        serde_json::Value::String(s) => (k, s),
                        other => (k, other.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;
        kill_guard.disarm();

        if !status.is_success() {
            return Err(EngineError::Execution(format!(
                "ClickHouse returned {}: {}",
                status,
                body.trim()
            )));
        }
        Ok((summary, body))
    }
}

fn map_transport_error(err: reqwest::Error, timeout: Duration) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout(timeout)
    } else if err.is_connect() {
        EngineError::Connection(err.to_string())
    } else {
        EngineError::Execution(err.to_string())
    }
}

fn parse_compact(body: &str) -> Result<CompactResponse, EngineError> {
    serde_json::from_str(body)
        .map_err(|e| EngineError::Execution(format!("failed to parse ClickHouse response: {}", e)))
}

fn summary_count(summary: &HashMap<String, String>, key: &str) -> u64 {
    summary
        .get(key)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
}

#[async_trait]
impl EngineAdapter for DistributedEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Distributed
    }

    fn capabilities(&self) -> &EngineCapabilities {
        &self.capabilities
    }

    async fn initialize(&self) -> Result<(), EngineError> {
        let ping = self
            .client
            .get(format!("{}/ping", self.base_url))
            .timeout(self.config.connect_timeout)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(format!("ClickHouse ping failed: {}", e)))?;
        if !ping.status().is_success() {
            return Err(EngineError::Unavailable(format!(
                "ClickHouse ping returned {}",
                ping.status()
            )));
        }

        for database in &self.config.databases {
            let sql = format!("CREATE DATABASE IF NOT EXISTS `{}`", database);
            self.post_statement(&sql, Duration::from_secs(30)).await?;
            debug!("Ensured ClickHouse database {}", database);
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!("Distributed engine initialized at {}", self.base_url);
        Ok(())
    }

    async fn execute(&self, sql: &str, timeout: Duration) -> Result<ResultEnvelope, EngineError> {
        let start_time = Instant::now();
        debug!("Executing on distributed engine: {}", sql);

        let (summary, body) = self.post_statement(sql, timeout).await?;
        let execution_time_ms = start_time.elapsed().as_millis() as u64;

        if body.trim().is_empty() {
            let written = summary_count(&summary, "written_rows");
            return Ok(ResultEnvelope::affected(EngineKind::Distributed, written, execution_time_ms)
                .with_metric("backend", "clickhouse")
                .with_metric("written_bytes", summary_count(&summary, "written_bytes")));
        }

        let response = parse_compact(&body)?;
        let columns = response
            .meta
            .into_iter()
            .map(|c| ResultColumn {
                name: c.name,
                data_type: c.column_type,
            })
            .collect();

        let mut envelope = ResultEnvelope::with_rows(
            EngineKind::Distributed,
            columns,
            response.data,
            execution_time_ms,
        )
        .with_metric("backend", "clickhouse");
        if let Some(rows) = response.rows {
            envelope.row_count = rows;
        }
        if let Some(stats) = response.statistics {
            envelope = envelope
                .with_metric("server_elapsed_seconds", stats.elapsed)
                .with_metric("rows_read", stats.rows_read)
                .with_metric("bytes_read", stats.bytes_read);
        }
        Ok(envelope)
    }

    async fn health_check(&self) -> bool {
        if !self.initialized.load(Ordering::SeqCst) {
            return false;
        }
        match self
            .client
            .get(format!("{}/ping", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("ClickHouse health check failed: {}", e);
                false
            }
        }
    }

    async fn describe_table(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<TableColumn>, EngineError> {
        let sql = format!("DESCRIBE TABLE `{}`.`{}`", database, table);
        let (_, body) = self.post_statement(&sql, Duration::from_secs(30)).await?;
        let response = parse_compact(&body)?;

        let columns = response
            .data
            .into_iter()
            .filter_map(|row| {
                let name = row.first()?.as_str()?.to_string();
                let data_type = row.get(1)?.as_str()?.to_string();
                let nullable = data_type.starts_with("Nullable(");
                Some(TableColumn {
                    name,
                    data_type,
                    nullable,
                })
            })
            .collect();
        Ok(columns)
    }

    async fn shutdown(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        info!("Distributed engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_response() {
        let body = r#"{"meta":[{"name":"n","type":"UInt64"},{"name":"s","type":"String"}],
            "data":[[1,"a"],[2,"b"]],"rows":2,
            "statistics":{"elapsed":0.001,"rows_read":2,"bytes_read":16}}"#;
        let parsed = parse_compact(body).unwrap();
        assert_eq!(parsed.meta.len(), 2);
        assert_eq!(parsed.meta[0].column_type, "UInt64");
        assert_eq!(parsed.data[1][1], serde_json::json!("b"));
        assert_eq!(parsed.rows, Some(2));
    }

    #[test]
    fn test_summary_count() {
        let mut summary = HashMap::new();
        summary.insert("written_rows".to_string(), "42".to_string());
        assert_eq!(summary_count(&summary, "written_rows"), 42);
        assert_eq!(summary_count(&summary, "read_rows"), 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let engine = DistributedEngine::new(DistributedConfig {
            url: "http://127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(200),
            ..DistributedConfig::default()
        })
        .unwrap();

        assert!(!engine.health_check().await);
        let err = engine.initialize().await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }
}
