//! Scheduler loop
//!
//! One task owns the slot pool, the admission queue and every job. Callers
//! talk to it through `Command` messages; workers report back through a
//! completion channel. Nothing else mutates scheduler state.

use crate::config::SchedulerConfig;
use crate::db::MetadataStore;
use crate::error::{BqError, ErrorKind, Result};
use crate::execution::{EngineKind, QueryRouter, ResultEnvelope};
use crate::ingestion::execute_plan;
use crate::jobs::job::{Job, JobError, JobFilter, JobId, JobInfo, JobPayload, JobState};
use crate::jobs::queue::{AdmissionQueue, QueuedEntry};
use crate::jobs::slots::SlotPool;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Requests handled by the scheduler loop
pub(crate) enum Command {
    Submit {
        job: Job,
        reply: oneshot::Sender<JobInfo>,
    },
    Status {
        job_id: JobId,
        reply: oneshot::Sender<Option<JobInfo>>,
    },
    Result {
        job_id: JobId,
        reply: oneshot::Sender<Result<ResultEnvelope>>,
    },
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Wait {
        job_id: JobId,
        reply: oneshot::Sender<Result<JobInfo>>,
    },
    List {
        filter: JobFilter,
        reply: oneshot::Sender<Vec<JobInfo>>,
    },
    Stats {
        reply: oneshot::Sender<SchedulerStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub total_slots: u32,
    pub available_slots: u32,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

enum Outcome {
    Success(ResultEnvelope),
    Failure(JobError),
}

struct Completion {
    job_id: JobId,
    outcome: Outcome,
}

/// Messages for the background history writer
pub(crate) enum PersistMessage {
    Job(JobInfo),
    /// Answered once every earlier message is written
    Flush(oneshot::Sender<()>),
}

/// Ordered writer of job snapshots to the metadata store
pub(crate) fn spawn_persister(store: Arc<MetadataStore>) -> mpsc::UnboundedSender<PersistMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistMessage>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                PersistMessage::Job(info) => {
                    let store = store.clone();
                    let job_id = info.job_id.clone();
                    match tokio::task::spawn_blocking(move || store.upsert_job(&info)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Failed to persist job {}: {}", job_id, e),
                        Err(e) => warn!("Job history writer task failed for {}: {}", job_id, e),
                    }
                }
                PersistMessage::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }
        debug!("Job history writer stopped");
    });
    tx
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn execute_payload(
    router: &QueryRouter,
    payload: &JobPayload,
    engine: EngineKind,
    allow_fallback: bool,
    timeout: Duration,
) -> std::result::Result<ResultEnvelope, JobError> {
    match payload {
        JobPayload::Query { sql } => router
            .route_with(engine, sql, timeout, allow_fallback)
            .await
            .map_err(|failure| JobError::from_route(failure, sql)),
        JobPayload::Ingest(plan) => execute_plan(router, plan, timeout).await,
    }
}

pub(crate) struct Scheduler {
    config: SchedulerConfig,
    router: Arc<QueryRouter>,
    slots: SlotPool,
    queue: AdmissionQueue,
    jobs: HashMap<JobId, Job>,
    /// Supervisor task of each running job
    running: HashMap<JobId, AbortHandle>,
    /// Terminal jobs in the order they finished
    finished: VecDeque<(JobId, Instant)>,
    waiters: HashMap<JobId, Vec<oneshot::Sender<Result<JobInfo>>>>,
    next_seq: u64,
    completions_tx: mpsc::UnboundedSender<Completion>,
    persist_tx: Option<mpsc::UnboundedSender<PersistMessage>>,
}

impl Scheduler {
    /// Spawn the scheduler loop and return its command channel
    pub(crate) fn spawn(
        config: SchedulerConfig,
        router: Arc<QueryRouter>,
        persist_tx: Option<mpsc::UnboundedSender<PersistMessage>>,
    ) -> mpsc::Sender<Command> {
        let (commands_tx, commands_rx) = mpsc::channel(1024);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let scheduler = Scheduler {
            slots: SlotPool::new(config.total_slots),
            config,
            router,
            queue: AdmissionQueue::new(),
            jobs: HashMap::new(),
            running: HashMap::new(),
            finished: VecDeque::new(),
            waiters: HashMap::new(),
            next_seq: 0,
            completions_tx,
            persist_tx,
        };
        tokio::spawn(scheduler.run(commands_rx, completions_rx));
        commands_tx
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        info!("Scheduler started with {} slots", self.slots.total());
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(completion) = completions.recv() => self.complete(completion),
                _ = tick.tick() => self.evict(Instant::now()),
            }
            self.dispatch();
        }

        info!("Scheduler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { job, reply } => {
                let info = self.enqueue(job);
                let _ = reply.send(info);
            }
            Command::Status { job_id, reply } => {
                let _ = reply.send(self.jobs.get(&job_id).map(Job::info));
            }
            Command::Result { job_id, reply } => {
                let _ = reply.send(self.result(&job_id));
            }
            Command::Cancel { job_id, reply } => {
                let _ = reply.send(self.cancel(&job_id));
            }
            Command::Wait { job_id, reply } => match self.jobs.get(&job_id) {
                None => {
                    let _ = reply.send(Err(BqError::NotFound(format!("job '{}'", job_id))));
                }
                Some(job) if job.state.is_terminal() => {
                    let _ = reply.send(Ok(job.info()));
                }
                Some(_) => self.waiters.entry(job_id).or_default().push(reply),
            },
            Command::List { filter, reply } => {
                let _ = reply.send(self.list(&filter));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn enqueue(&mut self, job: Job) -> JobInfo {
        self.next_seq += 1;
        let entry = QueuedEntry {
            job_id: job.id.clone(),
            priority: job.priority,
            seq: self.next_seq,
            slots: job.estimated_slots,
            enqueued_at: Instant::now(),
        };
        debug!(
            "Job {} queued (priority {}, {} slots)",
            job.id, job.priority, job.estimated_slots
        );

        let info = job.info();
        self.queue.push(entry);
        self.jobs.insert(job.id.clone(), job);
        self.persist(&info);
        info
    }

    /// Admit queued jobs while capacity allows
    fn dispatch(&mut self) {
        let now = Instant::now();
        while let Some(entry) =
            self.queue
                .pop_admissible(self.slots.available(), now, self.config.aging_threshold)
        {
            if !self.slots.try_acquire(entry.slots) {
                error!(
                    "Admitted job {} needs {} slots but only {} are free",
                    entry.job_id,
                    entry.slots,
                    self.slots.available()
                );
                self.queue.push(entry);
                break;
            }
            self.start(entry);
        }
    }

    fn start(&mut self, entry: QueuedEntry) {
        let Some(job) = self.jobs.get_mut(&entry.job_id) else {
            self.slots.release(entry.slots);
            return;
        };
        job.transition(JobState::Running);

        let job_id = job.id.clone();
        let payload = job.payload.clone();
        let engine = job.engine;
        let allow_fallback = job.allow_fallback;
        let max_execution_time = job.max_execution_time;
        let router = self.router.clone();
        let completions = self.completions_tx.clone();

        info!(
            "Job {} running on {} ({} slots, {} free)",
            job_id,
            engine,
            entry.slots,
            self.slots.available()
        );

        let supervised_id = job_id.clone();
        let supervisor = tokio::spawn(async move {
            let described = payload.describe();
            let mut worker = AbortOnDrop(tokio::spawn(async move {
                execute_payload(&router, &payload, engine, allow_fallback, max_execution_time).await
            }));

            let outcome = match tokio::time::timeout(max_execution_time, &mut worker.0).await {
                Ok(Ok(Ok(result))) => Outcome::Success(result),
                Ok(Ok(Err(job_error))) => Outcome::Failure(job_error),
                Ok(Err(join_error)) => Outcome::Failure(JobError::new(
                    ErrorKind::Execution,
                    format!("execution worker failed: {}", join_error),
                    engine,
                    &described,
                )),
                Err(_) => Outcome::Failure(JobError::new(
                    ErrorKind::Timeout,
                    format!(
                        "exceeded max execution time of {}s",
                        max_execution_time.as_secs_f64()
                    ),
                    engine,
                    &described,
                )),
            };
            drop(worker);

            let _ = completions.send(Completion {
                job_id: supervised_id,
                outcome,
            });
        });

        self.running.insert(job_id, supervisor.abort_handle());
    }

    fn complete(&mut self, completion: Completion) {
        let job_id = completion.job_id;
        let Some(job) = self.jobs.get_mut(&job_id) else {
            debug!("Discarding result for unknown job {}", job_id);
            return;
        };
        if job.state != JobState::Running {
            debug!("Discarding late result for job {} ({})", job_id, job.state);
            return;
        }

        self.running.remove(&job_id);
        self.slots.release(job.estimated_slots);

        match completion.outcome {
            Outcome::Success(result) => {
                info!(
                    "Job {} completed: {} rows in {}ms on {}{}",
                    job_id,
                    result.row_count,
                    result.execution_time_ms,
                    result.engine,
                    if result.fallback_used { " (fallback)" } else { "" }
                );
                job.result = Some(result);
                job.transition(JobState::Completed);
            }
            Outcome::Failure(job_error) => {
                warn!("Job {} failed: {}", job_id, job_error);
                job.error = Some(job_error);
                job.transition(JobState::Failed);
            }
        }

        self.finish(&job_id);
    }

    fn cancel(&mut self, job_id: &str) -> Result<bool> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BqError::NotFound(format!("job '{}'", job_id)))?;

        match job.state {
            JobState::Queued => {
                self.queue.remove(job_id);
            }
            JobState::Running => {
                if let Some(handle) = self.running.remove(job_id) {
                    handle.abort();
                }
                self.slots.release(job.estimated_slots);
            }
            _ => return Ok(false),
        }
        job.transition(JobState::Cancelled);
        info!("Job {} cancelled", job_id);

        self.finish(job_id);
        Ok(true)
    }

    /// Bookkeeping after a terminal transition
    fn finish(&mut self, job_id: &str) {
        let Some(info) = self.jobs.get(job_id).map(Job::info) else {
            return;
        };
        self.persist(&info);
        self.finished.push_back((job_id.to_string(), Instant::now()));

        if let Some(waiters) = self.waiters.remove(job_id) {
            for waiter in waiters {
                let _ = waiter.send(Ok(info.clone()));
            }
        }
        self.evict(Instant::now());
    }

    /// Drop terminal jobs beyond capacity or retention, oldest first
    fn evict(&mut self, now: Instant) {
        while self.finished.len() > self.config.history_capacity {
            if let Some((job_id, _)) = self.finished.pop_front() {
                self.jobs.remove(&job_id);
            }
        }
        while let Some((job_id, finished_at)) = self.finished.front() {
            if now.saturating_duration_since(*finished_at) < self.config.history_retention {
                break;
            }
            debug!("Evicting job {} from memory", job_id);
            self.jobs.remove(job_id);
            self.finished.pop_front();
        }
    }

    fn result(&self, job_id: &str) -> Result<ResultEnvelope> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| BqError::NotFound(format!("job '{}'", job_id)))?;

        match job.state {
            JobState::Completed => job.result.clone().ok_or_else(|| {
                BqError::Execution(format!("job '{}' completed without a result", job_id))
            }),
            JobState::Failed => Err(match &job.error {
                Some(job_error) => job_error.to_bq_error(),
                None => BqError::Execution(format!("job '{}' failed", job_id)),
            }),
            JobState::Cancelled => {
                Err(BqError::Cancelled(format!("job '{}' was cancelled", job_id)))
            }
            JobState::Queued | JobState::Running => Err(BqError::NotReady(format!(
                "job '{}' is {}",
                job_id, job.state
            ))),
        }
    }

    fn list(&self, filter: &JobFilter) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .jobs
            .values()
            .map(Job::info)
            .filter(|info| filter.matches(info))
            .collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        jobs
    }

    fn stats(&self) -> SchedulerStats {
        let count = |state: JobState| self.jobs.values().filter(|j| j.state == state).count();
        SchedulerStats {
            total_slots: self.slots.total(),
            available_slots: self.slots.available(),
            queued: self.queue.len(),
            running: self.running.len(),
            completed: count(JobState::Completed),
            failed: count(JobState::Failed),
            cancelled: count(JobState::Cancelled),
        }
    }

    fn persist(&self, info: &JobInfo) {
        if let Some(tx) = &self.persist_tx {
            if tx.send(PersistMessage::Job(info.clone())).is_err() {
                warn!("Job history writer is gone; job {} not persisted", info.job_id);
            }
        }
    }

    /// Cancel everything still queued or running
    fn shutdown(&mut self) {
        let queued: Vec<JobId> = self.queue.drain().into_iter().map(|e| e.job_id).collect();
        let running: Vec<JobId> = self.running.keys().cloned().collect();
        info!(
            "Scheduler shutting down: cancelling {} queued and {} running jobs",
            queued.len(),
            running.len()
        );

        for job_id in queued {
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.transition(JobState::Cancelled);
            }
            self.finish(&job_id);
        }
        for job_id in running {
            if let Err(e) = self.cancel(&job_id) {
                warn!("Failed to cancel job {} during shutdown: {}", job_id, e);
            }
        }
    }
}
