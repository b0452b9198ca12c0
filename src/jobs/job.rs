//! Job model
//!
//! A job moves monotonically QUEUED -> RUNNING -> {COMPLETED, FAILED, CANCELLED}
//! (a queued job may also be cancelled directly). Only the scheduler loop
//! mutates jobs; everything else sees `JobInfo` snapshots.

use crate::error::{BqError, ErrorKind};
use crate::execution::{EngineKind, ResultEnvelope, RouteFailure};
use crate::ingestion::IngestPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub type JobId = String;

/// Most urgent priority
pub const HIGHEST_PRIORITY: u8 = 1;
/// Least urgent priority
pub const LOWEST_PRIORITY: u8 = 5;
pub const DEFAULT_PRIORITY: u8 = HIGHEST_PRIORITY;
pub const DEFAULT_ESTIMATED_SLOTS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// Allowed forward transitions
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Cancelled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Some(JobState::Queued),
            "RUNNING" => Some(JobState::Running),
            "COMPLETED" => Some(JobState::Completed),
            "FAILED" => Some(JobState::Failed),
            "CANCELLED" => Some(JobState::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Query,
    Ingest,
}

/// Structured failure stored on a FAILED job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub engine: EngineKind,
    pub sql: String,
    /// Partial progress of the failed work, such as an ingestion report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, engine: EngineKind, sql: &str) -> Self {
        Self {
            kind,
            message: message.into(),
            engine,
            sql: sql.to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn from_route(failure: RouteFailure, sql: &str) -> Self {
        let engine = failure.engine;
        let error = BqError::from(failure);
        Self::new(error.kind(), error.to_string(), engine, sql)
    }

    /// The matching `BqError` for callers of `get_result`
    pub fn to_bq_error(&self) -> BqError {
        let message = format!("{} (engine: {}, sql: {})", self.message, self.engine, self.sql);
        match self.kind {
            ErrorKind::InvalidRequest => BqError::InvalidRequest(message),
            ErrorKind::EngineUnavailable => BqError::EngineUnavailable(message),
            ErrorKind::Timeout => BqError::Timeout(message),
            ErrorKind::SchemaValidationFailed => BqError::SchemaValidationFailed(message),
            ErrorKind::NotFound => BqError::NotFound(message),
            ErrorKind::NotReady => BqError::NotReady(message),
            ErrorKind::Cancelled => BqError::Cancelled(message),
            ErrorKind::Execution | ErrorKind::Internal => BqError::Execution(message),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} on {}", self.kind.as_str(), self.message, self.engine)
    }
}

/// Work a job performs
#[derive(Debug, Clone)]
pub enum JobPayload {
    /// One SQL statement
    Query { sql: String },
    /// Batched inserts of decoded records
    Ingest(IngestPlan),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Query { .. } => JobKind::Query,
            JobPayload::Ingest(_) => JobKind::Ingest,
        }
    }

    /// SQL text shown in status and history
    pub fn describe(&self) -> String {
        match self {
            JobPayload::Query { sql } => sql.clone(),
            JobPayload::Ingest(plan) => plan.describe(),
        }
    }
}

/// A submission before validation
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub payload: JobPayload,
    pub engine: EngineKind,
    pub priority: u8,
    pub estimated_slots: u32,
    /// None applies the configured default
    pub max_execution_time: Option<Duration>,
    /// Let the router use the fallback engine when `engine` is unhealthy
    pub allow_fallback: bool,
}

impl JobRequest {
    pub fn query(sql: impl Into<String>, engine: EngineKind) -> Self {
        Self::new(JobPayload::Query { sql: sql.into() }, engine)
    }

    pub fn new(payload: JobPayload, engine: EngineKind) -> Self {
        Self {
            payload,
            engine,
            priority: DEFAULT_PRIORITY,
            estimated_slots: DEFAULT_ESTIMATED_SLOTS,
            max_execution_time: None,
            allow_fallback: true,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_slots(mut self, estimated_slots: u32) -> Self {
        self.estimated_slots = estimated_slots;
        self
    }

    pub fn with_timeout(mut self, max_execution_time: Duration) -> Self {
        self.max_execution_time = Some(max_execution_time);
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.allow_fallback = false;
        self
    }
}

/// Job owned by the scheduler loop
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub engine: EngineKind,
    pub priority: u8,
    pub estimated_slots: u32,
    pub max_execution_time: Duration,
    pub allow_fallback: bool,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<ResultEnvelope>,
    pub error: Option<JobError>,
}

impl Job {
    pub fn from_request(request: JobRequest, max_execution_time: Duration) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload: request.payload,
            engine: request.engine,
            priority: request.priority,
            estimated_slots: request.estimated_slots,
            max_execution_time,
            allow_fallback: request.allow_fallback,
            state: JobState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }

    /// Move to `next`; returns false (and changes nothing) for a backward move
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        match next {
            JobState::Running => self.started_at = Some(now),
            _ => self.finished_at = Some(now),
        }
        self.state = next;
        true
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            job_id: self.id.clone(),
            kind: self.payload.kind(),
            sql: self.payload.describe(),
            engine: self.engine,
            priority: self.priority,
            estimated_slots: self.estimated_slots,
            max_execution_time_secs: self.max_execution_time.as_secs(),
            state: self.state,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
            row_count: self.result.as_ref().map(|r| r.row_count),
            execution_time_ms: self.result.as_ref().map(|r| r.execution_time_ms),
            executed_engine: self.result.as_ref().map(|r| r.engine),
            fallback_used: self.result.as_ref().map(|r| r.fallback_used).unwrap_or(false),
        }
    }
}

/// Snapshot of a job, as returned by status queries and kept in history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub kind: JobKind,
    pub sql: String,
    pub engine: EngineKind,
    pub priority: u8,
    pub estimated_slots: u32,
    pub max_execution_time_secs: u64,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
    pub row_count: Option<u64>,
    pub execution_time_ms: Option<u64>,
    /// Engine that actually ran the job (differs from `engine` after fallback)
    pub executed_engine: Option<EngineKind>,
    pub fallback_used: bool,
}

/// Filter for job listings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub engine: Option<EngineKind>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &JobInfo) -> bool {
        self.state.map_or(true, |s| s == job.state) && self.engine.map_or(true, |e| e == job.engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_monotonic() {
        let mut job = Job::from_request(
            JobRequest::query("SELECT 1", EngineKind::Embedded),
            Duration::from_secs(5),
        );
        assert!(!job.transition(JobState::Completed));
        assert!(job.transition(JobState::Running));
        assert!(job.started_at.is_some());
        assert!(!job.transition(JobState::Queued));
        assert!(job.transition(JobState::Completed));
        assert!(job.finished_at.is_some());
        assert!(!job.transition(JobState::Failed));
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn test_job_error_round_trip_to_bq_error() {
        let error =
            JobError::new(ErrorKind::Timeout, "too slow", EngineKind::Distributed, "SELECT 1");
        let bq = error.to_bq_error();
        assert_eq!(bq.kind(), ErrorKind::Timeout);
        assert!(bq.to_string().contains("SELECT 1"));
    }

    #[test]
    fn test_filter() {
        let job = Job::from_request(
            JobRequest::query("SELECT 1", EngineKind::Embedded),
            Duration::from_secs(5),
        );
        let info = job.info();
        assert!(JobFilter::default().matches(&info));
        assert!(JobFilter {
            state: Some(JobState::Queued),
            engine: Some(EngineKind::Embedded),
            limit: None
        }
        .matches(&info));
        assert!(!JobFilter {
            engine: Some(EngineKind::Distributed),
            ..Default::default()
        }
        .matches(&info));
    }
}
