//! BigQuery-lite
//!
//! A query console backend: a slot-budgeted job manager routes SQL to an
//! embedded (SQLite) or distributed (ClickHouse) engine, a schema registry
//! turns protobuf and BigQuery JSON schemas into engine tables, and an
//! ingestion pipeline loads length-delimited protobuf payloads into them.

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod ingestion;
pub mod jobs;
pub mod logging;
pub mod schema;

pub use app::AppState;
pub use config::AppConfig;
pub use error::{BqError, ErrorKind, Result};
