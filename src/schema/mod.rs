//! Schema Registry & Translator
//!
//! Source definitions (protobuf or BigQuery JSON) are parsed into a canonical
//! field tree, versioned per (database, table), translated to engine DDL and
//! provisioned on engines.

pub mod bigquery_json;
pub mod compat;
pub mod field;
pub mod parser;
pub mod proto;
pub mod registry;
pub mod tables;
pub mod translator;

pub use compat::{check_compatibility, ChangeKind, Compatibility, CompatibilityReport, SchemaChange};
pub use field::{compute_schema_id, validate_fields, Field, FieldType, Nullability};
pub use parser::{AutoSchemaParser, ParsedSchema, SchemaParser, SourceFormat};
pub use proto::{parse_proto, ProtoSchema};
pub use registry::{
    EngineTableBinding, LogicalSchema, Registration, SchemaRegistry, SchemaSummary, SchemaVersion,
};
pub use tables::{create_tables, TableCreationResult};
pub use translator::{
    default_mode, flattened_view_sql, plan_columns, translate_fields, PlannedColumn, TableDdl,
    TranslateMode,
};

use crate::error::{BqError, Result};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Table, database and field names
pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(BqError::SchemaValidationFailed(format!(
            "'{}' is not a valid identifier (expected [A-Za-z_][A-Za-z0-9_]*)",
            name
        )))
    }
}
