//! BigQuery-lite API server

use anyhow::{Context, Result};
use bqlite::{api, logging, AppConfig, AppState};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "bigquery-lite")]
#[command(about = "Query console backend with slot-budgeted jobs on two engines")]
struct Cli {
    /// Address to bind (overrides BQLITE_BIND)
    #[arg(long, env = "BQLITE_BIND")]
    bind: Option<String>,

    /// Total slot capacity (overrides BQLITE_TOTAL_SLOTS)
    #[arg(long)]
    slots: Option<u32>,

    /// Metadata database path (overrides BQLITE_METADATA_DB)
    #[arg(long)]
    metadata_db: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env().context("invalid configuration")?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(slots) = cli.slots {
        config.scheduler.total_slots = slots;
    }
    if let Some(path) = cli.metadata_db {
        config.metadata_db = path;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.validate().context("invalid configuration")?;

    logging::init(&config.log_level)?;
    info!(
        "Starting BigQuery-lite v{} ({} slots, metadata at {})",
        env!("CARGO_PKG_VERSION"),
        config.scheduler.total_slots,
        config.metadata_db.display()
    );

    let bind = config.bind.clone();
    let state = AppState::build(config).await.context("startup failed")?;

    let server_state = state.clone();
    tokio::select! {
        result = api::serve(&bind, server_state) => result.context("server error")?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    state.shutdown().await;
    Ok(())
}
