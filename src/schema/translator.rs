//! Schema Translator - field tree to engine DDL
//!
//! Pure functions. Each engine has a fixed, total mapping from logical type to
//! native type, written as exhaustive matches so a new logical type cannot be
//! added without mapping it everywhere.
//!
//! Two emission modes:
//! - nested: one column per top-level field, composites kept whole (ClickHouse
//!   `Tuple`/`Array`, JSON text on the embedded engine)
//! - flattened: RECORD fields expand into `parent_child` columns, a column is
//!   nullable when the field or any ancestor is NULLABLE, REPEATED stays one
//!   column (JSON text on the embedded engine, `Array` on ClickHouse)

use crate::error::{BqError, Result};
use crate::execution::{EngineCapabilities, EngineKind};
use crate::schema::field::{Field, FieldType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Suffix of the flattened view created next to nested tables
pub const FLATTENED_VIEW_SUFFIX: &str = "_flat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslateMode {
    Nested,
    Flattened,
}

impl TranslateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranslateMode::Nested => "nested",
            TranslateMode::Flattened => "flattened",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nested" => Some(TranslateMode::Nested),
            "flattened" | "flat" => Some(TranslateMode::Flattened),
            _ => None,
        }
    }

    /// Mode used when a caller does not choose one
    pub fn default_for(capabilities: &EngineCapabilities) -> Self {
        if capabilities.supports_nested_types {
            TranslateMode::Nested
        } else {
            TranslateMode::Flattened
        }
    }
}

/// Mode used for an engine when no binding chose one
pub fn default_mode(engine: EngineKind) -> TranslateMode {
    let capabilities = match engine {
        EngineKind::Embedded => EngineCapabilities::embedded(),
        EngineKind::Distributed => EngineCapabilities::distributed(),
    };
    TranslateMode::default_for(&capabilities)
}

/// One physical column produced from the field tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedColumn {
    pub name: String,
    /// Field names from the root to the source field
    pub path: Vec<String>,
    /// Logical type of the source field
    #[serde(skip)]
    pub field_type: FieldType,
    /// Native type as the engine reports it
    pub sql_type: String,
    /// Nullability as the engine reports it
    pub nullable: bool,
}

/// DDL for one table on one engine
#[derive(Debug, Clone, Serialize)]
pub struct TableDdl {
    pub engine: EngineKind,
    pub mode: TranslateMode,
    pub database: String,
    pub table: String,
    pub ddl: String,
    pub columns: Vec<PlannedColumn>,
}

// ---------------------------------------------------------------------------
// Type tables
// ---------------------------------------------------------------------------

fn embedded_type(field_type: &FieldType) -> &'static str {
    match field_type {
        FieldType::String => "TEXT",
        FieldType::Int64 => "INTEGER",
        FieldType::Float64 => "REAL",
        FieldType::Bool => "BOOLEAN",
        FieldType::Timestamp => "TIMESTAMP",
        FieldType::Date => "DATE",
        FieldType::Numeric => "NUMERIC(38,9)",
        FieldType::Record(_) | FieldType::Repeated(_) => "JSON",
    }
}

fn distributed_scalar(field_type: &FieldType) -> &'static str {
    match field_type {
        FieldType::String => "String",
        FieldType::Int64 => "Int64",
        FieldType::Float64 => "Float64",
        FieldType::Bool => "Bool",
        FieldType::Timestamp => "DateTime64(6, 'UTC')",
        FieldType::Date => "Date32",
        FieldType::Numeric => "Decimal(38, 9)",
        FieldType::Record(_) => "Tuple",
        FieldType::Repeated(_) => "Array",
    }
}

/// ClickHouse type; `Tuple` and `Array` cannot be wrapped in `Nullable`
fn distributed_type(field_type: &FieldType, nullable: bool) -> String {
    match field_type {
        FieldType::Record(children) => {
            let elements: Vec<String> = children
                .iter()
                .map(|c| {
                    format!(
                        "{} {}",
                        c.name,
                        distributed_type(&c.field_type, nullable || c.is_nullable())
                    )
                })
                .collect();
            format!("Tuple({})", elements.join(", "))
        }
        FieldType::Repeated(inner) => format!("Array({})", distributed_type(inner, false)),
        scalar => {
            let base = distributed_scalar(scalar);
            if nullable {
                format!("Nullable({})", base)
            } else {
                base.to_string()
            }
        }
    }
}

/// Native column type and reported nullability
fn native_column(engine: EngineKind, field_type: &FieldType, nullable: bool) -> (String, bool) {
    match engine {
        EngineKind::Embedded => (embedded_type(field_type).to_string(), nullable),
        EngineKind::Distributed => {
            let reported = nullable && !field_type.is_record() && !field_type.is_repeated();
            (distributed_type(field_type, nullable), reported)
        }
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

pub fn quote_ident(engine: EngineKind, name: &str) -> String {
    match engine {
        EngineKind::Embedded => format!("\"{}\"", name.replace('"', "\"\"")),
        EngineKind::Distributed => format!("`{}`", name.replace('`', "\\`")),
    }
}

pub fn qualified_table(engine: EngineKind, database: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(engine, database), quote_ident(engine, table))
}

// ---------------------------------------------------------------------------
// Column planning
// ---------------------------------------------------------------------------

/// Physical columns for a field tree on an engine
pub fn plan_columns(
    fields: &[Field],
    engine: EngineKind,
    mode: TranslateMode,
) -> Result<Vec<PlannedColumn>> {
    let mut columns = Vec::new();
    match mode {
        TranslateMode::Nested => {
            for field in fields {
                let (sql_type, nullable) =
                    native_column(engine, &field.field_type, field.is_nullable());
                columns.push(PlannedColumn {
                    name: field.name.clone(),
                    path: vec![field.name.clone()],
                    field_type: field.field_type.clone(),
                    sql_type,
                    nullable,
                });
            }
        }
        TranslateMode::Flattened => flatten(fields, engine, "", &[], false, &mut columns),
    }

    let mut seen = HashSet::new();
    for column in &columns {
        if !seen.insert(column.name.to_ascii_lowercase()) {
            return Err(BqError::SchemaValidationFailed(format!(
                "flattened column '{}' (from {}) collides with another column",
                column.name,
                column.path.join(".")
            )));
        }
    }
    Ok(columns)
}

fn flatten(
    fields: &[Field],
    engine: EngineKind,
    prefix: &str,
    path: &[String],
    ancestor_nullable: bool,
    out: &mut Vec<PlannedColumn>,
) {
    for field in fields {
        let name = if prefix.is_empty() {
            field.name.clone()
        } else {
            format!("{}_{}", prefix, field.name)
        };
        let mut field_path = path.to_vec();
        field_path.push(field.name.clone());
        let nullable = ancestor_nullable || field.is_nullable();

        match &field.field_type {
            FieldType::Record(children) => {
                flatten(children, engine, &name, &field_path, nullable, out)
            }
            other => {
                let (sql_type, reported) = native_column(engine, other, nullable);
                out.push(PlannedColumn {
                    name,
                    path: field_path,
                    field_type: other.clone(),
                    sql_type,
                    nullable: reported,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DDL
// ---------------------------------------------------------------------------

/// CREATE TABLE for a field tree
pub fn translate_fields(
    fields: &[Field],
    database: &str,
    table: &str,
    engine: EngineKind,
    mode: TranslateMode,
    if_not_exists: bool,
) -> Result<TableDdl> {
    let columns = plan_columns(fields, engine, mode)?;
    let definitions: Vec<String> = columns
        .iter()
        .map(|c| match engine {
            EngineKind::Embedded if !c.nullable => {
                format!("  {} {} NOT NULL", quote_ident(engine, &c.name), c.sql_type)
            }
            _ => format!("  {} {}", quote_ident(engine, &c.name), c.sql_type),
        })
        .collect();

    let mut ddl = format!(
        "CREATE TABLE {}{} (\n{}\n)",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        qualified_table(engine, database, table),
        definitions.join(",\n")
    );
    if engine == EngineKind::Distributed {
        ddl.push_str(" ENGINE = MergeTree() ORDER BY tuple()");
    }

    Ok(TableDdl {
        engine,
        mode,
        database: database.to_string(),
        table: table.to_string(),
        ddl,
        columns,
    })
}

/// View exposing a nested table as flattened columns; None without RECORD fields
pub fn flattened_view_sql(
    fields: &[Field],
    database: &str,
    table: &str,
    engine: EngineKind,
) -> Result<Option<String>> {
    if !fields.iter().any(|f| f.field_type.is_record()) {
        return Ok(None);
    }
    let columns = plan_columns(fields, engine, TranslateMode::Flattened)?;

    let projections: Vec<String> = columns
        .iter()
        .map(|c| {
            let alias = quote_ident(engine, &c.name);
            if c.path.len() == 1 {
                return alias;
            }
            let root = quote_ident(engine, &c.path[0]);
            let expression = match engine {
                EngineKind::Embedded => {
                    format!("json_extract({}, '$.{}')", root, c.path[1..].join("."))
                }
                EngineKind::Distributed => c.path[1..]
                    .iter()
                    .fold(root, |inner, name| format!("tupleElement({}, '{}')", inner, name)),
            };
            format!("{} AS {}", expression, alias)
        })
        .collect();

    let view = qualified_table(engine, database, &format!("{}{}", table, FLATTENED_VIEW_SUFFIX));
    // SQLite views in an attached database resolve unqualified names in that database
    let source = match engine {
        EngineKind::Embedded => quote_ident(engine, table),
        EngineKind::Distributed => qualified_table(engine, database, table),
    };

    Ok(Some(format!(
        "CREATE VIEW IF NOT EXISTS {} AS SELECT {} FROM {}",
        view,
        projections.join(", "),
        source
    )))
}

// ---------------------------------------------------------------------------
// Inserts
// ---------------------------------------------------------------------------

fn quote_string(engine: EngineKind, value: &str) -> String {
    match engine {
        EngineKind::Embedded => format!("'{}'", value.replace('\'', "''")),
        EngineKind::Distributed => {
            format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
        }
    }
}

fn scalar_literal(engine: EngineKind, value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => match engine {
            EngineKind::Embedded => if *b { "1" } else { "0" }.to_string(),
            EngineKind::Distributed => b.to_string(),
        },
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_string(engine, s),
        other => quote_string(engine, &other.to_string()),
    }
}

/// SQL literal for a value of a column's logical type
pub fn render_literal(engine: EngineKind, value: &Value, field_type: &FieldType) -> String {
    match (engine, field_type) {
        (EngineKind::Embedded, FieldType::Record(_))
        | (EngineKind::Embedded, FieldType::Repeated(_)) => match value {
            Value::Null => "NULL".to_string(),
            other => quote_string(engine, &other.to_string()),
        },
        (EngineKind::Distributed, FieldType::Record(children)) => {
            let elements: Vec<String> = children
                .iter()
                .map(|c| {
                    let child = value.get(&c.name).unwrap_or(&Value::Null);
                    render_literal(engine, child, &c.field_type)
                })
                .collect();
            if elements.len() == 1 {
                format!("tuple({})", elements[0])
            } else {
                format!("({})", elements.join(", "))
            }
        }
        (EngineKind::Distributed, FieldType::Repeated(inner)) => {
            let items: Vec<String> = value
                .as_array()
                .map(|items| items.iter().map(|v| render_literal(engine, v, inner)).collect())
                .unwrap_or_default();
            format!("[{}]", items.join(", "))
        }
        (_, _) => scalar_literal(engine, value),
    }
}

/// Value of a planned column within a decoded record
pub fn column_value<'a>(record: &'a Value, column: &PlannedColumn) -> &'a Value {
    let mut current = record;
    for name in &column.path {
        match current.get(name) {
            Some(next) => current = next,
            None => return &Value::Null,
        }
    }
    current
}

/// Multi-row INSERT for decoded records
pub fn insert_sql(
    engine: EngineKind,
    database: &str,
    table: &str,
    columns: &[PlannedColumn],
    records: &[Value],
) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(engine, &c.name)).collect();
    let rows: Vec<String> = records
        .iter()
        .map(|record| {
            let values: Vec<String> = columns
                .iter()
                .map(|c| render_literal(engine, column_value(record, c), &c.field_type))
                .collect();
            format!("({})", values.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified_table(engine, database, table),
        names.join(", "),
        rows.join(", ")
    )
}
