//! Application wiring
//!
//! config -> engines -> router -> metadata store -> job manager -> schema
//! registry -> ingestion pipeline.

use crate::config::AppConfig;
use crate::db::MetadataStore;
use crate::error::{BqError, Result};
use crate::execution::{DistributedEngine, EmbeddedEngine, QueryRouter};
use crate::ingestion::IngestionPipeline;
use crate::jobs::JobManager;
use crate::schema::{AutoSchemaParser, SchemaRegistry};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state handed to every API handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub router: Arc<QueryRouter>,
    pub jobs: JobManager,
    pub registry: Arc<SchemaRegistry>,
    pub ingestion: Arc<IngestionPipeline>,
    pub store: Arc<MetadataStore>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Build engines from configuration, initialize them and wire everything up
    pub async fn build(config: AppConfig) -> Result<Self> {
        let embedded = EmbeddedEngine::new(config.embedded.clone());
        let distributed = DistributedEngine::new(config.distributed.clone())
            .map_err(|e| BqError::Config(format!("distributed engine: {}", e)))?;

        let router = QueryRouter::new()
            .with_engine(Arc::new(embedded))
            .with_engine(Arc::new(distributed))
            .with_fallbacks(&config.fallbacks);

        for (engine, outcome) in router.initialize_all().await {
            if let Err(e) = outcome {
                warn!("Engine {} unavailable at startup: {}", engine, e);
            }
        }

        let path = config.metadata_db.clone();
        let store = tokio::task::spawn_blocking(move || MetadataStore::open(path))
            .await
            .map_err(|e| BqError::Database(format!("metadata store open failed: {}", e)))??;

        Self::from_parts(config, Arc::new(router), Arc::new(store))
    }

    /// Wire state around an already-built router and store
    pub fn from_parts(
        config: AppConfig,
        router: Arc<QueryRouter>,
        store: Arc<MetadataStore>,
    ) -> Result<Self> {
        let jobs = JobManager::start(config.scheduler.clone(), router.clone(), Some(store.clone()));
        let registry = Arc::new(SchemaRegistry::new(store.clone(), Arc::new(AutoSchemaParser))?);
        let ingestion = Arc::new(IngestionPipeline::new(
            registry.clone(),
            jobs.clone(),
            config.ingestion.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            router,
            jobs,
            registry,
            ingestion,
            store,
            started_at: Utc::now(),
        })
    }

    /// Stop the scheduler, then the engines
    pub async fn shutdown(&self) {
        if let Err(e) = self.jobs.shutdown().await {
            warn!("Scheduler shutdown: {}", e);
        }
        self.router.shutdown_all().await;
        info!("Shutdown complete");
    }
}
