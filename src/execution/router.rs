//! Query Router - Resolves a healthy engine adapter for each statement
//!
//! Failover policy lives here and nowhere else: the requested engine is used
//! when healthy, otherwise the configured fallback (when healthy), otherwise
//! the statement fails with `EngineUnavailable`. DDL and DML are routed the
//! same way.

use crate::error::BqError;
use crate::execution::engine::{EngineAdapter, EngineError, EngineKind};
use crate::execution::result::ResultEnvelope;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Failure of a routed statement, tagged with the engine involved
#[derive(Debug, Clone, PartialEq)]
pub struct RouteFailure {
    pub engine: EngineKind,
    pub error: EngineError,
}

impl fmt::Display for RouteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine '{}': {}", self.engine, self.error)
    }
}

impl From<RouteFailure> for BqError {
    fn from(failure: RouteFailure) -> Self {
        let message = failure.to_string();
        match failure.error {
            EngineError::Unavailable(_) | EngineError::Connection(_) => {
                BqError::EngineUnavailable(message)
            }
            EngineError::Timeout(_) => BqError::Timeout(message),
            EngineError::Cancelled(_) => BqError::Cancelled(message),
            EngineError::Execution(_) => BqError::Execution(message),
        }
    }
}

/// Query router over the registered adapters
#[derive(Clone, Default)]
pub struct QueryRouter {
    engines: HashMap<EngineKind, Arc<dyn EngineAdapter>>,
    fallbacks: HashMap<EngineKind, EngineKind>,
}

impl QueryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind
    pub fn with_engine(mut self, adapter: Arc<dyn EngineAdapter>) -> Self {
        self.engines.insert(adapter.kind(), adapter);
        self
    }

    /// Configure `to` as the fallback for `from`
    pub fn with_fallback(mut self, from: EngineKind, to: EngineKind) -> Self {
        if from != to {
            self.fallbacks.insert(from, to);
        }
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: &HashMap<EngineKind, EngineKind>) -> Self {
        for (from, to) in fallbacks {
            self = self.with_fallback(*from, *to);
        }
        self
    }

    pub fn has_engine(&self, kind: EngineKind) -> bool {
        self.engines.contains_key(&kind)
    }

    pub fn engine(&self, kind: EngineKind) -> Option<&Arc<dyn EngineAdapter>> {
        self.engines.get(&kind)
    }

    /// Registered engines in stable order
    pub fn available_engines(&self) -> Vec<EngineKind> {
        let mut kinds: Vec<EngineKind> = self.engines.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn fallback_for(&self, kind: EngineKind) -> Option<EngineKind> {
        self.fallbacks.get(&kind).copied()
    }

    /// Route a statement to a healthy engine and execute it
    pub async fn route(
        &self,
        engine: EngineKind,
        sql: &str,
        timeout: Duration,
    ) -> Result<ResultEnvelope, RouteFailure> {
        self.route_with(engine, sql, timeout, true).await
    }

    /// Route with fallback optionally disabled, for SQL written in one engine's dialect
    pub async fn route_with(
        &self,
        engine: EngineKind,
        sql: &str,
        timeout: Duration,
        allow_fallback: bool,
    ) -> Result<ResultEnvelope, RouteFailure> {
        let requested = self.engines.get(&engine).ok_or_else(|| RouteFailure {
            engine,
            error: EngineError::Unavailable(format!("engine '{}' is not registered", engine)),
        })?;

        if requested.health_check().await {
            debug!("Routing statement to {}", engine);
            return self.execute_on(requested, sql, timeout).await;
        }

        warn!("Engine {} reported unhealthy", engine);

        if !allow_fallback {
            return Err(RouteFailure {
                engine,
                error: EngineError::Unavailable(format!(
                    "engine '{}' is unhealthy and fallback is disabled for this statement",
                    engine
                )),
            });
        }

        if let Some(fallback_kind) = self.fallback_for(engine) {
            if let Some(fallback) = self.engines.get(&fallback_kind) {
                if fallback.health_check().await {
                    info!("Executing via fallback from {} to {}", engine, fallback_kind);
                    let mut result = self.execute_on(fallback, sql, timeout).await?;
                    result.fallback_used = true;
                    result.engine_metrics.insert(
                        "requested_engine".to_string(),
                        serde_json::Value::String(engine.to_string()),
                    );
                    return Ok(result);
                }
                warn!("Fallback engine {} is also unhealthy", fallback_kind);
            }
        }

        Err(RouteFailure {
            engine,
            error: EngineError::Unavailable(match self.fallback_for(engine) {
                Some(fallback) => format!(
                    "engine '{}' and fallback '{}' are unhealthy",
                    engine, fallback
                ),
                None => format!("engine '{}' is unhealthy and has no fallback", engine),
            }),
        })
    }

    async fn execute_on(
        &self,
        adapter: &Arc<dyn EngineAdapter>,
        sql: &str,
        timeout: Duration,
    ) -> Result<ResultEnvelope, RouteFailure> {
        let start_time = Instant::now();
        match adapter.execute(sql, timeout).await {
            Ok(mut result) => {
                if result.execution_time_ms == 0 {
                    result.execution_time_ms = start_time.elapsed().as_millis() as u64;
                }
                Ok(result)
            }
            Err(error) => Err(RouteFailure {
                engine: adapter.kind(),
                error,
            }),
        }
    }

    /// Initialize every adapter; failures are reported, not fatal
    pub async fn initialize_all(&self) -> BTreeMap<EngineKind, Result<(), EngineError>> {
        let mut results = BTreeMap::new();
        for (kind, adapter) in &self.engines {
            let outcome = adapter.initialize().await;
            match &outcome {
                Ok(()) => info!("Engine {} initialized", kind),
                Err(e) => warn!("Engine {} failed to initialize: {}", kind, e),
            }
            results.insert(*kind, outcome);
        }
        results
    }

    /// Health of every registered engine
    pub async fn health(&self) -> BTreeMap<EngineKind, bool> {
        let mut health = BTreeMap::new();
        for (kind, adapter) in &self.engines {
            health.insert(*kind, adapter.health_check().await);
        }
        health
    }

    pub async fn shutdown_all(&self) {
        for (kind, adapter) in &self.engines {
            adapter.shutdown().await;
            debug!("Engine {} shut down", kind);
        }
    }
}
