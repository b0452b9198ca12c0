//! Schema source parsers
//!
//! The registry takes its parser as a trait object so tests can inject a
//! deterministic one.

use crate::error::Result;
use crate::schema::bigquery_json::parse_bigquery_json;
use crate::schema::field::{validate_fields, Field};
use crate::schema::proto::parse_proto;
use serde::{Deserialize, Serialize};

/// Source format of a registered definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Proto,
    BigqueryJson,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Proto => "proto",
            SourceFormat::BigqueryJson => "bigquery_json",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "proto" => Some(SourceFormat::Proto),
            "bigquery_json" => Some(SourceFormat::BigqueryJson),
            _ => None,
        }
    }

    /// Guess the format of a definition from its first character
    pub fn detect(source: &str) -> Self {
        match source.trim_start().chars().next() {
            Some('[') | Some('{') => SourceFormat::BigqueryJson,
            _ => SourceFormat::Proto,
        }
    }
}

/// Result of parsing a source definition
#[derive(Debug, Clone)]
pub struct ParsedSchema {
    pub fields: Vec<Field>,
    pub format: SourceFormat,
    /// Root message name for proto sources
    pub root_message: Option<String>,
}

/// Converts source definition text into a canonical field tree
pub trait SchemaParser: Send + Sync {
    fn parse(&self, source: &str) -> Result<ParsedSchema>;
}

/// Parser that detects the format and dispatches
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoSchemaParser;

impl SchemaParser for AutoSchemaParser {
    fn parse(&self, source: &str) -> Result<ParsedSchema> {
        match SourceFormat::detect(source) {
            SourceFormat::BigqueryJson => Ok(ParsedSchema {
                fields: parse_bigquery_json(source)?,
                format: SourceFormat::BigqueryJson,
                root_message: None,
            }),
            SourceFormat::Proto => {
                let schema = parse_proto(source)?;
                let fields = schema.fields();
                validate_fields(&fields)?;
                Ok(ParsedSchema {
                    fields,
                    format: SourceFormat::Proto,
                    root_message: Some(schema.root.name.clone()),
                })
            }
        }
    }
}
