//! Protobuf Ingestion Pipeline

pub mod decoder;
pub mod pipeline;

pub use decoder::{decode_message, split_length_delimited, Frames};
pub use pipeline::{
    execute_plan, IngestBatch, IngestPlan, IngestRequest, IngestionOutcome, IngestionPipeline,
    IngestionReport, INGESTION_METRIC,
};
