//! BigQuery JSON schema parser
//!
//! Accepts a bare field array (`[{"name": .., "type": ..}]`) or an object with
//! a `fields` array, optionally wrapped in `schema`.

use crate::error::{BqError, Result};
use crate::schema::field::{validate_fields, Field};
use serde_json::Value;

pub fn parse_bigquery_json(source: &str) -> Result<Vec<Field>> {
    let value: Value = serde_json::from_str(source)
        .map_err(|e| BqError::SchemaValidationFailed(format!("invalid schema JSON: {}", e)))?;

    let array = match value {
        Value::Array(_) => value,
        Value::Object(mut object) => {
            let inner = match object.remove("schema") {
                Some(Value::Object(mut schema)) => schema.remove("fields"),
                _ => object.remove("fields"),
            };
            inner.ok_or_else(|| {
                BqError::SchemaValidationFailed("schema JSON has no 'fields' array".to_string())
            })?
        }
        _ => {
            return Err(BqError::SchemaValidationFailed(
                "schema JSON must be an array of field definitions".to_string(),
            ))
        }
    };

    let fields: Vec<Field> = serde_json::from_value(array)
        .map_err(|e| BqError::SchemaValidationFailed(format!("invalid field definition: {}", e)))?;
    validate_fields(&fields)?;
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field::FieldType;

    #[test]
    fn test_bare_array() {
        let fields = parse_bigquery_json(
            r#"[
                {"name": "id", "type": "STRING", "mode": "REQUIRED", "description": "key"},
                {"name": "payload", "type": "RECORD", "fields": [
                    {"name": "size", "type": "INTEGER"}
                ]}
            ]"#,
        )
        .unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].description.as_deref(), Some("key"));
        assert!(fields[1].field_type.is_record());
    }

    #[test]
    fn test_wrapped_object() {
        let fields = parse_bigquery_json(
            r#"{"schema": {"fields": [{"name": "d", "type": "DATE", "mode": "REPEATED"}]}}"#,
        )
        .unwrap();
        assert_eq!(fields[0].field_type, FieldType::Repeated(Box::new(FieldType::Date)));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_bigquery_json("{").is_err());
        assert!(parse_bigquery_json("[]").is_err());
        assert!(parse_bigquery_json(r#"{"name": "x"}"#).is_err());
        let duplicate = r#"[{"name": "a", "type": "STRING"}, {"name": "a", "type": "INT64"}]"#;
        assert!(parse_bigquery_json(duplicate).is_err());
    }
}
