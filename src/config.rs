//! Configuration
//!
//! Settings are read from environment variables (a `.env` file is loaded by the
//! server binary) and can be overridden by command-line flags.

use crate::error::{BqError, Result};
use crate::execution::EngineKind;
use crate::schema::validate_identifier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Scheduler and slot-pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Total slot capacity of the pool
    pub total_slots: u32,

    /// Wait after which the oldest queued job gets capacity reserved for it
    pub aging_threshold: Duration,

    /// Maximum number of finished jobs kept in memory
    pub history_capacity: usize,

    /// How long finished jobs stay in memory
    pub history_retention: Duration,

    /// Execution time limit applied when a submission does not give one
    pub default_max_execution_time: Duration,

    /// Upper bound accepted for a submission's execution time limit
    pub max_execution_time_limit: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            total_slots: 10,
            aging_threshold: Duration::from_secs(30),
            history_capacity: 1000,
            history_retention: Duration::from_secs(3600),
            default_max_execution_time: Duration::from_secs(300),
            max_execution_time_limit: Duration::from_secs(3600),
        }
    }
}

/// Embedded engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedConfig {
    /// Database file, or `:memory:`
    pub path: String,

    /// Database names attached as schemas so `db.table` resolves
    pub databases: Vec<String>,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            databases: vec![DEFAULT_DATABASE.to_string()],
        }
    }
}

/// Distributed engine settings (ClickHouse HTTP interface)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub databases: Vec<String>,
    pub connect_timeout: Duration,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            user: "admin".to_string(),
            password: "password".to_string(),
            databases: vec![DEFAULT_DATABASE.to_string()],
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub default_batch_size: usize,
    pub max_errors: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 1000,
            max_errors: 100,
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub embedded: EmbeddedConfig,
    pub distributed: DistributedConfig,
    pub ingestion: IngestionConfig,

    /// Metadata store (job history, schema registry)
    pub metadata_db: PathBuf,

    /// Engine used when the requested one is unhealthy
    pub fallbacks: HashMap<EngineKind, EngineKind>,

    /// HTTP bind address
    pub bind: String,

    /// Default log level when RUST_LOG is not set
    pub log_level: String,
}

/// Database used when a registration does not name one
pub const DEFAULT_DATABASE: &str = "bigquery_lite";

impl Default for AppConfig {
    fn default() -> Self {
        let mut fallbacks = HashMap::new();
        fallbacks.insert(EngineKind::Distributed, EngineKind::Embedded);

        Self {
            scheduler: SchedulerConfig::default(),
            embedded: EmbeddedConfig::default(),
            distributed: DistributedConfig::default(),
            ingestion: IngestionConfig::default(),
            metadata_db: PathBuf::from("data/bqlite_metadata.db"),
            fallbacks,
            bind: "127.0.0.1:8001".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Build configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("BQLITE_TOTAL_SLOTS") {
            config.scheduler.total_slots = parse_value("BQLITE_TOTAL_SLOTS", &v)?;
        }
        if let Some(v) = lookup("BQLITE_AGING_THRESHOLD_SECS") {
            config.scheduler.aging_threshold = parse_secs("BQLITE_AGING_THRESHOLD_SECS", &v)?;
        }
        if let Some(v) = lookup("BQLITE_HISTORY_CAPACITY") {
            config.scheduler.history_capacity = parse_value("BQLITE_HISTORY_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("BQLITE_HISTORY_RETENTION_SECS") {
            config.scheduler.history_retention = parse_secs("BQLITE_HISTORY_RETENTION_SECS", &v)?;
        }
        if let Some(v) = lookup("BQLITE_DEFAULT_TIMEOUT_SECS") {
            config.scheduler.default_max_execution_time =
                parse_secs("BQLITE_DEFAULT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("BQLITE_MAX_TIMEOUT_SECS") {
            config.scheduler.max_execution_time_limit = parse_secs("BQLITE_MAX_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = lookup("BQLITE_METADATA_DB") {
            config.metadata_db = PathBuf::from(v);
        }
        if let Some(v) = lookup("BQLITE_EMBEDDED_PATH") {
            config.embedded.path = v;
        }
        if let Some(v) = lookup("BQLITE_DATABASES") {
            let databases = parse_list(&v);
            config.embedded.databases = databases.clone();
            config.distributed.databases = databases;
        }

        let host = lookup("CLICKHOUSE_HOST").unwrap_or_else(|| "localhost".to_string());
        let port = match lookup("CLICKHOUSE_PORT") {
            Some(v) => parse_value::<u16>("CLICKHOUSE_PORT", &v)?,
            None => 8123,
        };
        config.distributed.url = format!("http://{}:{}", host, port);
        if let Some(v) = lookup("CLICKHOUSE_USER") {
            config.distributed.user = v;
        }
        if let Some(v) = lookup("CLICKHOUSE_PASSWORD") {
            config.distributed.password = v;
        }

        if let Some(v) = lookup("BQLITE_FALLBACK") {
            config.fallbacks = parse_fallbacks(&v)?;
        }
        if let Some(v) = lookup("BQLITE_BIND") {
            config.bind = v;
        }
        if let Some(v) = lookup("BQLITE_INGEST_BATCH_SIZE") {
            config.ingestion.default_batch_size = parse_value("BQLITE_INGEST_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("BQLITE_INGEST_MAX_ERRORS") {
            config.ingestion.max_errors = parse_value("BQLITE_INGEST_MAX_ERRORS", &v)?;
        }
        if let Some(v) = lookup("BQLITE_LOG_LEVEL") {
            config.log_level = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.total_slots == 0 {
            return Err(BqError::Config("total_slots must be at least 1".to_string()));
        }
        if self.scheduler.history_capacity == 0 {
            return Err(BqError::Config("history_capacity must be at least 1".to_string()));
        }
        if self.scheduler.default_max_execution_time > self.scheduler.max_execution_time_limit {
            return Err(BqError::Config(
                "default execution time exceeds the configured maximum".to_string(),
            ));
        }
        if self.ingestion.default_batch_size == 0 {
            return Err(BqError::Config("ingestion batch size must be at least 1".to_string()));
        }
        for name in self.embedded.databases.iter().chain(self.distributed.databases.iter()) {
            validate_identifier(name).map_err(|e| BqError::Config(e.to_string()))?;
        }
        for (from, to) in &self.fallbacks {
            if from == to {
                return Err(BqError::Config(format!("engine {} cannot fall back to itself", from)));
            }
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| BqError::Config(format!("{} has invalid value '{}'", key, value)))
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    parse_value::<u64>(key, value).map(Duration::from_secs)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Parse `from=to` pairs, e.g. `distributed=embedded`
fn parse_fallbacks(value: &str) -> Result<HashMap<EngineKind, EngineKind>> {
    let mut fallbacks = HashMap::new();
    for pair in parse_list(value) {
        let (from, to) = pair
            .split_once('=')
            .ok_or_else(|| BqError::Config(format!("invalid fallback pair '{}'", pair)))?;
        let from = EngineKind::from_str(from.trim()).map_err(BqError::Config)?;
        let to = EngineKind::from_str(to.trim()).map_err(BqError::Config)?;
        fallbacks.insert(from, to);
    }
    Ok(fallbacks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.scheduler.total_slots, 10);
        assert_eq!(config.distributed.url, "http://localhost:8123");
        assert_eq!(
            config.fallbacks.get(&EngineKind::Distributed),
            Some(&EngineKind::Embedded)
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("BQLITE_TOTAL_SLOTS", "4"),
            ("BQLITE_AGING_THRESHOLD_SECS", "5"),
            ("CLICKHOUSE_HOST", "ch.internal"),
            ("CLICKHOUSE_PORT", "18123"),
            ("BQLITE_DATABASES", "analytics, staging"),
            ("BQLITE_FALLBACK", "embedded=distributed"),
        ]))
        .unwrap();

        assert_eq!(config.scheduler.total_slots, 4);
        assert_eq!(config.scheduler.aging_threshold, Duration::from_secs(5));
        assert_eq!(config.distributed.url, "http://ch.internal:18123");
        assert_eq!(config.embedded.databases, vec!["analytics", "staging"]);
        assert_eq!(
            config.fallbacks.get(&EngineKind::Embedded),
            Some(&EngineKind::Distributed)
        );
        assert!(config.fallbacks.get(&EngineKind::Distributed).is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::from_lookup(lookup_from(&[("BQLITE_TOTAL_SLOTS", "0")])).is_err());
        assert!(AppConfig::from_lookup(lookup_from(&[("BQLITE_TOTAL_SLOTS", "many")])).is_err());
        assert!(AppConfig::from_lookup(lookup_from(&[("BQLITE_DATABASES", "bad-name")])).is_err());
        let self_fallback = lookup_from(&[("BQLITE_FALLBACK", "embedded=embedded")]);
        assert!(AppConfig::from_lookup(self_fallback).is_err());
    }
}
