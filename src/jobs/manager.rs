//! Job Manager
//!
//! Validates submissions before anything is queued, then forwards every
//! operation to the scheduler loop. Cloning is cheap; all clones talk to the
//! same loop.

use crate::config::SchedulerConfig;
use crate::db::MetadataStore;
use crate::error::{BqError, Result};
use crate::execution::{EngineKind, QueryRouter, ResultEnvelope};
use crate::jobs::job::{
    Job, JobFilter, JobId, JobInfo, JobPayload, JobRequest, HIGHEST_PRIORITY, LOWEST_PRIORITY,
};
use crate::jobs::scheduler::{spawn_persister, Command, PersistMessage, Scheduler, SchedulerStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

#[derive(Clone)]
pub struct JobManager {
    commands: mpsc::Sender<Command>,
    config: SchedulerConfig,
    engines: Vec<EngineKind>,
    store: Option<Arc<MetadataStore>>,
    persist_tx: Option<mpsc::UnboundedSender<PersistMessage>>,
}

fn scheduler_gone() -> BqError {
    BqError::Execution("job scheduler is not running".to_string())
}

impl JobManager {
    /// Start the scheduler loop (and the history writer when a store is given)
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        router: Arc<QueryRouter>,
        store: Option<Arc<MetadataStore>>,
    ) -> Self {
        let engines = router.available_engines();
        let persist_tx = store.clone().map(spawn_persister);
        let commands = Scheduler::spawn(config.clone(), router, persist_tx.clone());

        info!(
            "Job manager started: {} slots, engines {:?}",
            config.total_slots, engines
        );

        Self {
            commands,
            config,
            engines,
            store,
            persist_tx,
        }
    }

    pub fn total_slots(&self) -> u32 {
        self.config.total_slots
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Check a request and resolve its execution time limit
    pub fn validate(&self, request: &JobRequest) -> Result<Duration> {
        if let JobPayload::Query { sql } = &request.payload {
            if sql.trim().is_empty() {
                return Err(BqError::InvalidRequest("sql must not be empty".to_string()));
            }
        }
        if request.estimated_slots == 0 || request.estimated_slots > self.config.total_slots {
            return Err(BqError::InvalidRequest(format!(
                "estimated_slots must be between 1 and {} (got {})",
                self.config.total_slots, request.estimated_slots
            )));
        }
        if !(HIGHEST_PRIORITY..=LOWEST_PRIORITY).contains(&request.priority) {
            return Err(BqError::InvalidRequest(format!(
                "priority must be between {} and {} (got {})",
                HIGHEST_PRIORITY, LOWEST_PRIORITY, request.priority
            )));
        }
        if !self.engines.contains(&request.engine) {
            return Err(BqError::InvalidRequest(format!(
                "engine '{}' is not registered",
                request.engine
            )));
        }

        let max_execution_time = request
            .max_execution_time
            .unwrap_or(self.config.default_max_execution_time);
        if max_execution_time.is_zero()
            || max_execution_time > self.config.max_execution_time_limit
        {
            return Err(BqError::InvalidRequest(format!(
                "max_execution_time must be between 1ms and {}s",
                self.config.max_execution_time_limit.as_secs()
            )));
        }
        Ok(max_execution_time)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| scheduler_gone())?;
        response.await.map_err(|_| scheduler_gone())
    }

    /// Queue a job; returns as soon as it is QUEUED
    pub async fn submit(&self, request: JobRequest) -> Result<JobId> {
        let max_execution_time = self.validate(&request)?;
        let job = Job::from_request(request, max_execution_time);
        let info = self.request(|reply| Command::Submit { job, reply }).await?;
        Ok(info.job_id)
    }

    pub async fn get_status(&self, job_id: &str) -> Result<JobInfo> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Status {
            job_id: job_id.clone(),
            reply,
        })
        .await?
        .ok_or_else(|| BqError::NotFound(format!("job '{}'", job_id)))
    }

    pub async fn get_result(&self, job_id: &str) -> Result<ResultEnvelope> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Result { job_id, reply }).await?
    }

    /// True when the job was queued or running and is now CANCELLED
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Cancel { job_id, reply }).await?
    }

    /// Resolves once the job is terminal
    pub async fn wait(&self, job_id: &str) -> Result<JobInfo> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Wait { job_id, reply }).await?
    }

    /// Jobs still held in memory, newest first
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<JobInfo>> {
        self.request(|reply| Command::List { filter, reply }).await
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Persisted jobs, newest first, including evicted ones
    pub async fn history(&self, limit: usize) -> Result<Vec<JobInfo>> {
        let (Some(store), Some(persist_tx)) = (&self.store, &self.persist_tx) else {
            return self
                .list(JobFilter {
                    limit: Some(limit),
                    ..Default::default()
                })
                .await;
        };

        let (flushed_tx, flushed) = oneshot::channel();
        if persist_tx.send(PersistMessage::Flush(flushed_tx)).is_ok() {
            let _ = flushed.await;
        }

        let store = store.clone();
        tokio::task::spawn_blocking(move || store.job_history(limit))
            .await
            .map_err(|e| BqError::Execution(format!("history read failed: {}", e)))?
    }

    /// Stop the loop; queued and running jobs end CANCELLED
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
