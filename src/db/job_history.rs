//! Persisted job history

use crate::db::store::{format_timestamp, parse_timestamp, MetadataStore};
use crate::error::{BqError, Result};
use crate::execution::EngineKind;
use crate::jobs::{JobError, JobInfo, JobKind, JobState};
use rusqlite::{params, OptionalExtension, Row};

const JOB_COLUMNS: &str = "job_id, kind, sql_text, engine, priority, estimated_slots, \
    max_execution_time_secs, state, submitted_at, started_at, finished_at, error, \
    row_count, execution_time_ms, executed_engine, fallback_used";

/// Raw row before conversion into `JobInfo`
struct JobRow {
    job_id: String,
    kind: String,
    sql: String,
    engine: String,
    priority: i64,
    estimated_slots: i64,
    max_execution_time_secs: i64,
    state: String,
    submitted_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    error: Option<String>,
    row_count: Option<i64>,
    execution_time_ms: Option<i64>,
    executed_engine: Option<String>,
    fallback_used: bool,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            kind: row.get(1)?,
            sql: row.get(2)?,
            engine: row.get(3)?,
            priority: row.get(4)?,
            estimated_slots: row.get(5)?,
            max_execution_time_secs: row.get(6)?,
            state: row.get(7)?,
            submitted_at: row.get(8)?,
            started_at: row.get(9)?,
            finished_at: row.get(10)?,
            error: row.get(11)?,
            row_count: row.get(12)?,
            execution_time_ms: row.get(13)?,
            executed_engine: row.get(14)?,
            fallback_used: row.get(15)?,
        })
    }

    fn into_info(self) -> Result<JobInfo> {
        let engine = |value: &str| {
            value
                .parse::<EngineKind>()
                .map_err(|e| BqError::Database(format!("job {}: {}", self.job_id, e)))
        };
        let kind = match self.kind.as_str() {
            "query" => JobKind::Query,
            "ingest" => JobKind::Ingest,
            other => {
                return Err(BqError::Database(format!(
                    "job {}: unknown kind '{}'",
                    self.job_id, other
                )))
            }
        };
        let state = JobState::parse(&self.state).ok_or_else(|| {
            BqError::Database(format!("job {}: unknown state '{}'", self.job_id, self.state))
        })?;
        let error: Option<JobError> = self
            .error
            .as_deref()
            .map(serde_json::from_str::<JobError>)
            .transpose()?;

        Ok(JobInfo {
            kind,
            sql: self.sql.clone(),
            engine: engine(&self.engine)?,
            priority: self.priority as u8,
            estimated_slots: self.estimated_slots as u32,
            max_execution_time_secs: self.max_execution_time_secs as u64,
            state,
            submitted_at: parse_timestamp(&self.submitted_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_timestamp).transpose()?,
            error,
            row_count: self.row_count.map(|n| n as u64),
            execution_time_ms: self.execution_time_ms.map(|n| n as u64),
            executed_engine: self.executed_engine.as_deref().map(engine).transpose()?,
            fallback_used: self.fallback_used,
            job_id: self.job_id.clone(),
        })
    }
}

fn kind_str(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Query => "query",
        JobKind::Ingest => "ingest",
    }
}

impl MetadataStore {
    /// Insert or replace the persisted snapshot of a job
    pub fn upsert_job(&self, job: &JobInfo) -> Result<()> {
        let error = job.error.as_ref().map(serde_json::to_string).transpose()?;
        let db = self.conn()?;
        db.execute(
            &format!(
                "INSERT OR REPLACE INTO job_history ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                JOB_COLUMNS
            ),
            params![
                job.job_id,
                kind_str(job.kind),
                job.sql,
                job.engine.as_str(),
                job.priority as i64,
                job.estimated_slots as i64,
                job.max_execution_time_secs as i64,
                job.state.as_str(),
                format_timestamp(&job.submitted_at),
                job.started_at.as_ref().map(format_timestamp),
                job.finished_at.as_ref().map(format_timestamp),
                error,
                job.row_count.map(|n| n as i64),
                job.execution_time_ms.map(|n| n as i64),
                job.executed_engine.map(|e| e.as_str()),
                job.fallback_used,
            ],
        )
        .map_err(|e| BqError::Database(format!("Failed to persist job {}: {}", job.job_id, e)))?;
        Ok(())
    }

    /// Persisted jobs, newest submission first
    pub fn job_history(&self, limit: usize) -> Result<Vec<JobInfo>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM job_history ORDER BY submitted_at DESC, rowid DESC LIMIT ?1",
            JOB_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], JobRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(db);

        rows.into_iter().map(JobRow::into_info).collect()
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobInfo>> {
        let db = self.conn()?;
        let row = db
            .query_row(
                &format!("SELECT {} FROM job_history WHERE job_id = ?1", JOB_COLUMNS),
                params![job_id],
                JobRow::from_row,
            )
            .optional()?;
        drop(db);

        row.map(JobRow::into_info).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::jobs::{Job, JobRequest};
    use std::time::Duration;

    fn sample_job(sql: &str) -> Job {
        Job::from_request(
            JobRequest::query(sql, EngineKind::Distributed).with_slots(2),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_upsert_and_read_back() {
        let store = MetadataStore::in_memory().unwrap();
        let mut job = sample_job("SELECT 1");
        store.upsert_job(&job.info()).unwrap();

        job.transition(JobState::Running);
        job.transition(JobState::Failed);
        job.error = Some(JobError::new(
            ErrorKind::EngineUnavailable,
            "down",
            EngineKind::Distributed,
            "SELECT 1",
        ));
        store.upsert_job(&job.info()).unwrap();

        let stored = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.estimated_slots, 2);
        assert_eq!(stored.error.unwrap().kind, ErrorKind::EngineUnavailable);
        assert!(stored.finished_at.is_some());
        assert!(store.get_job("missing").unwrap().is_none());
    }

    #[test]
    fn test_history_is_newest_first() {
        let store = MetadataStore::in_memory().unwrap();
        let first = sample_job("SELECT 1");
        let mut second = sample_job("SELECT 2");
        second.submitted_at = first.submitted_at + chrono::Duration::seconds(1);
        store.upsert_job(&first.info()).unwrap();
        store.upsert_job(&second.info()).unwrap();

        let history = store.job_history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sql, "SELECT 2");
        assert_eq!(store.job_history(1).unwrap().len(), 1);
    }
}
