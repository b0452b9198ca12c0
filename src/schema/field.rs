//! Canonical field tree
//!
//! Fields serialize in the BigQuery JSON schema shape
//! (`{"name", "type", "mode", "fields", "description"}`), which is also the
//! persisted form. REPEATED is a type wrapper here and a mode in the JSON shape.

use crate::error::{BqError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Field nullability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Nullability {
    Required,
    Nullable,
}

/// Logical type of a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int64,
    Float64,
    Bool,
    Timestamp,
    Date,
    Numeric,
    Record(Vec<Field>),
    Repeated(Box<FieldType>),
}

impl FieldType {
    /// Type name as written in BigQuery JSON (the element type for REPEATED)
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldType::String => "STRING",
            FieldType::Int64 => "INT64",
            FieldType::Float64 => "FLOAT64",
            FieldType::Bool => "BOOL",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Date => "DATE",
            FieldType::Numeric => "NUMERIC",
            FieldType::Record(_) => "RECORD",
            FieldType::Repeated(inner) => inner.type_name(),
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self, FieldType::Record(_))
    }

    pub fn is_repeated(&self) -> bool {
        matches!(self, FieldType::Repeated(_))
    }

    /// Subfields of a RECORD
    pub fn subfields(&self) -> Option<&[Field]> {
        match self {
            FieldType::Record(fields) => Some(fields),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Repeated(inner) => write!(f, "REPEATED<{}>", inner),
            FieldType::Record(fields) => write!(f, "RECORD<{} fields>", fields.len()),
            other => f.write_str(other.type_name()),
        }
    }
}

/// One node of the field tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FieldRepr", into = "FieldRepr")]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub nullability: Nullability,
    pub description: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType, nullability: Nullability) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullability,
            description: None,
        }
    }

    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(name, field_type, Nullability::Required)
    }

    pub fn nullable(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(name, field_type, Nullability::Nullable)
    }

    /// REPEATED field; an absent array is empty, so repeated fields are NULLABLE
    pub fn repeated(name: impl Into<String>, element: FieldType) -> Self {
        Self::new(name, FieldType::Repeated(Box::new(element)), Nullability::Nullable)
    }

    pub fn record(name: impl Into<String>, nullability: Nullability, fields: Vec<Field>) -> Self {
        Self::new(name, FieldType::Record(fields), nullability)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_nullable(&self) -> bool {
        self.nullability == Nullability::Nullable
    }

    /// Mode as written in BigQuery JSON
    pub fn mode(&self) -> &'static str {
        match (&self.field_type, self.nullability) {
            (FieldType::Repeated(_), _) => "REPEATED",
            (_, Nullability::Required) => "REQUIRED",
            (_, Nullability::Nullable) => "NULLABLE",
        }
    }
}

/// BigQuery JSON shape of a field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRepr {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldRepr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TryFrom<FieldRepr> for Field {
    type Error = String;

    fn try_from(repr: FieldRepr) -> std::result::Result<Self, Self::Error> {
        let nested = repr
            .fields
            .into_iter()
            .map(Field::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let base = match repr.field_type.trim().to_ascii_uppercase().as_str() {
            "STRING" | "BYTES" | "JSON" => FieldType::String,
            "INT64" | "INTEGER" => FieldType::Int64,
            "FLOAT64" | "FLOAT" => FieldType::Float64,
            "BOOL" | "BOOLEAN" => FieldType::Bool,
            "TIMESTAMP" | "DATETIME" => FieldType::Timestamp,
            "DATE" => FieldType::Date,
            "NUMERIC" | "BIGNUMERIC" | "DECIMAL" => FieldType::Numeric,
            "RECORD" | "STRUCT" => FieldType::Record(nested.clone()),
            other => {
                return Err(format!(
                    "field '{}' has unsupported type '{}'",
                    repr.name, other
                ))
            }
        };
        if !base.is_record() && !nested.is_empty() {
            return Err(format!(
                "field '{}' of type {} cannot have nested fields",
                repr.name,
                base.type_name()
            ));
        }

        let mode = repr
            .mode
            .as_deref()
            .map(|m| m.trim().to_ascii_uppercase())
            .unwrap_or_else(|| "NULLABLE".to_string());
        let (field_type, nullability) = match mode.as_str() {
            "NULLABLE" => (base, Nullability::Nullable),
            "REQUIRED" => (base, Nullability::Required),
            "REPEATED" => (FieldType::Repeated(Box::new(base)), Nullability::Nullable),
            other => return Err(format!("field '{}' has unsupported mode '{}'", repr.name, other)),
        };

        Ok(Field {
            name: repr.name,
            field_type,
            nullability,
            description: repr.description,
        })
    }
}

impl From<Field> for FieldRepr {
    fn from(field: Field) -> Self {
        let mode = field.mode().to_string();
        let mut element = field.field_type;
        while let FieldType::Repeated(inner) = element {
            element = *inner;
        }
        let fields = match &element {
            FieldType::Record(children) => children.iter().cloned().map(FieldRepr::from).collect(),
            _ => Vec::new(),
        };
        FieldRepr {
            name: field.name,
            field_type: element.type_name().to_string(),
            mode: Some(mode),
            fields,
            description: field.description,
        }
    }
}

/// Check the structural invariants of a field tree
pub fn validate_fields(fields: &[Field]) -> Result<()> {
    if fields.is_empty() {
        return Err(BqError::SchemaValidationFailed(
            "schema must contain at least one field".to_string(),
        ));
    }
    validate_level(fields, "")
}

fn validate_level(fields: &[Field], parent: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for field in fields {
        let path = if parent.is_empty() {
            field.name.clone()
        } else {
            format!("{}.{}", parent, field.name)
        };
        super::validate_identifier(&field.name).map_err(|_| {
            BqError::SchemaValidationFailed(format!("invalid field name '{}'", path))
        })?;
        if !seen.insert(field.name.to_ascii_lowercase()) {
            return Err(BqError::SchemaValidationFailed(format!(
                "duplicate field name '{}'",
                path
            )));
        }
        validate_type(&field.field_type, &path)?;
    }
    Ok(())
}

fn validate_type(field_type: &FieldType, path: &str) -> Result<()> {
    match field_type {
        FieldType::Record(children) => {
            if children.is_empty() {
                return Err(BqError::SchemaValidationFailed(format!(
                    "RECORD field '{}' has no subfields",
                    path
                )));
            }
            validate_level(children, path)
        }
        FieldType::Repeated(inner) => {
            if inner.is_repeated() {
                return Err(BqError::SchemaValidationFailed(format!(
                    "field '{}' is REPEATED of REPEATED",
                    path
                )));
            }
            validate_type(inner, path)
        }
        _ => Ok(()),
    }
}

#[derive(Serialize)]
struct CanonicalField<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    field_type: &'static str,
    mode: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<CanonicalField<'a>>,
}

fn canonical_fields(fields: &[Field]) -> Vec<CanonicalField<'_>> {
    fields
        .iter()
        .map(|f| {
            let mut element = &f.field_type;
            while let FieldType::Repeated(inner) = element {
                element = inner;
            }
            CanonicalField {
                name: &f.name,
                field_type: element.type_name(),
                mode: f.mode(),
                fields: element.subfields().map(canonical_fields).unwrap_or_default(),
            }
        })
        .collect()
}

/// Canonical text of a field tree; descriptions do not take part
pub fn canonical_json(fields: &[Field]) -> String {
    serde_json::to_string(&canonical_fields(fields)).unwrap_or_default()
}

/// Content hash of a field tree plus its table identity
pub fn compute_schema_id(database: &str, table: &str, fields: &[Field]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(database.as_bytes());
    hasher.update([0u8]);
    hasher.update(table.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(fields).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}
