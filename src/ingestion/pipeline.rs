//! Protobuf ingestion pipeline
//!
//! Decoding and SQL rendering happen up front (`prepare`); the resulting plan
//! runs as an ordinary job so ingestion shares the slot budget with queries.
//! Bad records are collected, never fatal.

use crate::config::IngestionConfig;
use crate::error::{BqError, ErrorKind, Result};
use crate::execution::{EngineKind, QueryRouter, ResultEnvelope};
use crate::ingestion::decoder::{decode_message, split_length_delimited};
use crate::jobs::{JobError, JobId, JobInfo, JobManager, JobPayload, JobRequest, JobState};
use crate::schema::translator::{insert_sql, plan_columns, translate_fields};
use crate::schema::{EngineTableBinding, SchemaRegistry, TranslateMode};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Key of the report inside the job's engine metrics
pub const INGESTION_METRIC: &str = "ingestion";

/// Counts and bounded error list of one ingestion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionReport {
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_failed: u64,
    pub batches: usize,
    pub batches_failed: usize,
    pub errors: Vec<String>,
    /// Errors beyond the configured limit, counted but not listed
    pub errors_omitted: u64,
}

impl IngestionReport {
    fn push_error(&mut self, message: String, max_errors: usize) {
        if self.errors.len() < max_errors {
            self.errors.push(message);
        } else {
            self.errors_omitted += 1;
        }
    }

    /// Error list with the overflow note appended
    pub fn error_messages(&self) -> Vec<String> {
        let mut errors = self.errors.clone();
        if self.errors_omitted > 0 {
            errors.push(format!("... {} more errors omitted", self.errors_omitted));
        }
        errors
    }

    /// Report carried by a completed ingestion job's result
    pub fn from_envelope(envelope: &ResultEnvelope) -> Option<Self> {
        envelope
            .engine_metrics
            .get(INGESTION_METRIC)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Report carried by a failed ingestion job's error
    pub fn from_job_error(error: &JobError) -> Option<Self> {
        error
            .details
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    fn attach_to(&self, error: JobError) -> JobError {
        match serde_json::to_value(self) {
            Ok(details) => error.with_details(details),
            Err(_) => error,
        }
    }
}

/// One INSERT statement
#[derive(Debug, Clone)]
pub struct IngestBatch {
    pub sql: String,
    pub records: u64,
    /// Index of the batch's first record in the payload
    pub first_record: u64,
}

/// Decoded payload ready to execute
#[derive(Debug, Clone)]
pub struct IngestPlan {
    pub schema_id: String,
    pub database: String,
    pub table: String,
    pub engine: EngineKind,
    pub mode: TranslateMode,
    pub create_table_sql: Option<String>,
    pub batches: Vec<IngestBatch>,
    /// Decode-stage counts and errors
    pub report: IngestionReport,
    pub max_errors: usize,
}

impl IngestPlan {
    pub fn describe(&self) -> String {
        format!(
            "INGEST INTO {}.{} ({} records in {} batches)",
            self.database,
            self.table,
            self.batches.iter().map(|b| b.records).sum::<u64>(),
            self.batches.len()
        )
    }
}

/// Table an ingestion provisions, bound to its schema once the job ends
#[derive(Debug, Clone)]
struct Provisioning {
    schema_id: String,
    engine: EngineKind,
    mode: TranslateMode,
    ddl: String,
}

impl Provisioning {
    fn from_plan(plan: &IngestPlan) -> Option<Self> {
        plan.create_table_sql.as_ref().map(|ddl| Self {
            schema_id: plan.schema_id.clone(),
            engine: plan.engine,
            mode: plan.mode,
            ddl: ddl.clone(),
        })
    }

    fn record(self, registry: &SchemaRegistry, info: &JobInfo) {
        // A failure names the DDL only when table creation itself failed;
        // after a timeout or cancellation the table state is unknown
        let (created, error) = match (info.state, &info.error) {
            (JobState::Completed, _) => (true, None),
            (JobState::Failed, Some(e)) if e.kind != ErrorKind::Timeout => {
                if e.sql == self.ddl {
                    (false, Some(e.message.clone()))
                } else {
                    (true, None)
                }
            }
            _ => return,
        };

        let binding = EngineTableBinding {
            schema_id: self.schema_id.clone(),
            engine: self.engine,
            mode: self.mode,
            ddl: self.ddl,
            created,
            error,
            job_id: Some(info.job_id.clone()),
            updated_at: Utc::now(),
        };
        if let Err(e) = registry.record_binding(binding) {
            warn!(
                "Failed to record table binding for {} on {}: {}",
                self.schema_id, self.engine, e
            );
        }
    }
}

/// Parameters of one ingestion
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub schema_id: String,
    pub engine: EngineKind,
    pub batch_size: Option<usize>,
    pub create_table_if_not_exists: bool,
    pub priority: Option<u8>,
    pub max_execution_time: Option<Duration>,
}

impl IngestRequest {
    pub fn new(schema_id: impl Into<String>, engine: EngineKind) -> Self {
        Self {
            schema_id: schema_id.into(),
            engine,
            batch_size: None,
            create_table_if_not_exists: false,
            priority: None,
            max_execution_time: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn create_table(mut self) -> Self {
        self.create_table_if_not_exists = true;
        self
    }
}

/// What `ingest` hands back once the job is terminal
#[derive(Debug, Clone, Serialize)]
pub struct IngestionOutcome {
    pub job_id: JobId,
    pub state: JobState,
    pub records_processed: u64,
    pub records_inserted: u64,
    pub errors: Vec<String>,
    pub error: Option<JobError>,
}

/// Run a plan through the router; used by the job worker
pub async fn execute_plan(
    router: &QueryRouter,
    plan: &IngestPlan,
    timeout: Duration,
) -> std::result::Result<ResultEnvelope, JobError> {
    let start_time = Instant::now();
    let mut report = plan.report.clone();

    if let Some(ddl) = &plan.create_table_sql {
        router
            .route_with(plan.engine, ddl, timeout, false)
            .await
            .map_err(|failure| report.attach_to(JobError::from_route(failure, ddl)))?;
    }

    let mut first_failure: Option<JobError> = None;
    for batch in &plan.batches {
        match router.route_with(plan.engine, &batch.sql, timeout, false).await {
            Ok(_) => report.records_inserted += batch.records,
            Err(failure) => {
                let job_error = JobError::from_route(failure, &plan.describe());
                warn!(
                    "Ingestion batch at record {} into {}.{} failed: {}",
                    batch.first_record, plan.database, plan.table, job_error
                );
                report.batches_failed += 1;
                report.records_failed += batch.records;
                report.push_error(
                    format!(
                        "batch of records {}..{}: {}",
                        batch.first_record,
                        batch.first_record + batch.records,
                        job_error.message
                    ),
                    plan.max_errors,
                );
                first_failure.get_or_insert(job_error);
            }
        }
    }

    if !plan.batches.is_empty() && report.batches_failed == plan.batches.len() {
        if let Some(mut job_error) = first_failure {
            job_error.message = format!(
                "all {} insert batches failed; first error: {}",
                plan.batches.len(),
                job_error.message
            );
            return Err(report.attach_to(job_error));
        }
    }

    info!(
        "Ingested {}/{} records into {}.{} on {}",
        report.records_inserted, report.records_processed, plan.database, plan.table, plan.engine
    );

    let inserted = report.records_inserted;
    let report = serde_json::to_value(&report).map_err(|e| {
        JobError::new(ErrorKind::Internal, e.to_string(), plan.engine, &plan.describe())
    })?;
    Ok(
        ResultEnvelope::affected(plan.engine, inserted, start_time.elapsed().as_millis() as u64)
            .with_metric(INGESTION_METRIC, report),
    )
}

pub struct IngestionPipeline {
    registry: Arc<SchemaRegistry>,
    jobs: JobManager,
    config: IngestionConfig,
}

impl IngestionPipeline {
    pub fn new(registry: Arc<SchemaRegistry>, jobs: JobManager, config: IngestionConfig) -> Self {
        Self {
            registry,
            jobs,
            config,
        }
    }

    /// Decode a length-delimited payload and render its INSERT batches
    pub fn prepare(&self, payload: &[u8], request: &IngestRequest) -> Result<IngestPlan> {
        let batch_size = request.batch_size.unwrap_or(self.config.default_batch_size);
        if batch_size == 0 {
            return Err(BqError::InvalidRequest("batch_size must be at least 1".to_string()));
        }

        let (version, proto) = self.registry.proto_schema(&request.schema_id)?;
        let mode = self.registry.mode_for(&request.schema_id, request.engine);
        let columns = plan_columns(&version.fields, request.engine, mode)?;

        let mut report = IngestionReport::default();
        let frames = split_length_delimited(payload);
        let mut records: Vec<(u64, Value)> = Vec::with_capacity(frames.messages.len());

        for (index, message) in frames.messages.iter().enumerate() {
            report.records_processed += 1;
            match decode_message(message, &proto.root) {
                Ok(record) => records.push((index as u64, Value::Object(record))),
                Err(e) => {
                    report.records_failed += 1;
                    report.push_error(format!("record {}: {}", index, e), self.config.max_errors);
                }
            }
        }
        if let Some(framing_error) = frames.framing_error {
            report.records_processed += 1;
            report.records_failed += 1;
            report.push_error(
                format!("record {}: {}", frames.messages.len(), framing_error),
                self.config.max_errors,
            );
        }

        let batches: Vec<IngestBatch> = records
            .chunks(batch_size)
            .map(|chunk| {
                let values: Vec<Value> = chunk.iter().map(|(_, record)| record.clone()).collect();
                IngestBatch {
                    sql: insert_sql(
                        request.engine,
                        &version.database_name,
                        &version.table_name,
                        &columns,
                        &values,
                    ),
                    records: chunk.len() as u64,
                    first_record: chunk[0].0,
                }
            })
            .collect();
        report.batches = batches.len();

        let create_table_sql = if request.create_table_if_not_exists {
            Some(
                translate_fields(
                    &version.fields,
                    &version.database_name,
                    &version.table_name,
                    request.engine,
                    mode,
                    true,
                )?
                .ddl,
            )
        } else {
            None
        };

        Ok(IngestPlan {
            schema_id: request.schema_id.clone(),
            database: version.database_name.clone(),
            table: version.table_name.clone(),
            engine: request.engine,
            mode,
            create_table_sql,
            batches,
            report,
            max_errors: self.config.max_errors,
        })
    }

    /// Queue an ingestion job
    pub async fn submit(&self, payload: &[u8], request: &IngestRequest) -> Result<JobId> {
        let plan = self.prepare(payload, request)?;
        let provisioning = Provisioning::from_plan(&plan);
        let job_id = self.submit_plan(plan, request).await?;

        if let Some(provisioning) = provisioning {
            let registry = self.registry.clone();
            let jobs = self.jobs.clone();
            let watched = job_id.clone();
            tokio::spawn(async move {
                if let Ok(info) = jobs.wait(&watched).await {
                    provisioning.record(&registry, &info);
                }
            });
        }
        Ok(job_id)
    }

    async fn submit_plan(&self, plan: IngestPlan, request: &IngestRequest) -> Result<JobId> {
        let mut job = JobRequest::new(JobPayload::Ingest(plan), request.engine).without_fallback();
        if let Some(priority) = request.priority {
            job = job.with_priority(priority);
        }
        if let Some(max_execution_time) = request.max_execution_time {
            job = job.with_timeout(max_execution_time);
        }
        self.jobs.submit(job).await
    }

    /// Queue an ingestion job and wait for it to finish
    pub async fn ingest(
        &self,
        payload: &[u8],
        request: &IngestRequest,
    ) -> Result<IngestionOutcome> {
        let plan = self.prepare(payload, request)?;
        let decoded = plan.report.clone();
        let provisioning = Provisioning::from_plan(&plan);
        let job_id = self.submit_plan(plan, request).await?;
        let info = self.jobs.wait(&job_id).await?;
        if let Some(provisioning) = provisioning {
            provisioning.record(&self.registry, &info);
        }

        // A job stopped by timeout or cancellation carries no report; the
        // decode-stage counts still hold
        let report = match info.state {
            JobState::Completed => {
                let envelope = self.jobs.get_result(&job_id).await?;
                IngestionReport::from_envelope(&envelope).unwrap_or(decoded)
            }
            _ => info
                .error
                .as_ref()
                .and_then(IngestionReport::from_job_error)
                .unwrap_or(decoded),
        };

        Ok(IngestionOutcome {
            job_id,
            state: info.state,
            records_processed: report.records_processed,
            records_inserted: report.records_inserted,
            errors: report.error_messages(),
            error: info.error,
        })
    }
}
