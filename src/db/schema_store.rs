//! Persisted schema registry state

use crate::db::store::{format_timestamp, parse_timestamp, MetadataStore};
use crate::error::{BqError, Result};
use crate::execution::EngineKind;
use crate::schema::{EngineTableBinding, LogicalSchema, SchemaVersion, SourceFormat, TranslateMode};
use rusqlite::{params, Connection};

impl MetadataStore {
    /// Append a version and move the logical schema's current pointer, atomically
    pub fn insert_schema_version(
        &self,
        version: &SchemaVersion,
        logical: &LogicalSchema,
    ) -> Result<()> {
        let fields = serde_json::to_string(&version.fields)?;
        let mut db = self.conn()?;
        let tx = db
            .transaction()
            .map_err(|e| BqError::Database(format!("Failed to start transaction: {}", e)))?;

        tx.execute(
            r#"
            INSERT INTO schema_versions
            (schema_id, database_name, table_name, version, fields, source_definition,
             source_format, root_message, previous_schema_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                version.schema_id,
                version.database_name,
                version.table_name,
                version.version,
                fields,
                version.source_definition,
                version.source_format.as_str(),
                version.root_message,
                version.previous_schema_id,
                format_timestamp(&version.created_at),
            ],
        )
        .map_err(|e| {
            BqError::Database(format!(
                "Failed to insert schema version {}: {}",
                version.schema_id, e
            ))
        })?;
        upsert_logical(&tx, logical)?;

        tx.commit()
            .map_err(|e| BqError::Database(format!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }

    /// Persist the current pointer and retired flag of a logical schema
    pub fn save_logical_schema(&self, logical: &LogicalSchema) -> Result<()> {
        let db = self.conn()?;
        upsert_logical(&db, logical)
    }

    /// Every stored version, oldest first within each logical schema
    pub fn load_schema_versions(&self) -> Result<Vec<SchemaVersion>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            r#"
            SELECT schema_id, database_name, table_name, version, fields, source_definition,
                   source_format, root_message, previous_schema_id, created_at
            FROM schema_versions
            ORDER BY database_name, table_name, version
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|row| -> Result<SchemaVersion> {
                let (
                    schema_id,
                    database_name,
                    table_name,
                    version,
                    fields,
                    source,
                    format,
                    root,
                    previous,
                    created,
                ) = row;
                let source_format = SourceFormat::parse(&format).ok_or_else(|| {
                    BqError::Database(format!(
                        "schema {}: unknown source format '{}'",
                        schema_id, format
                    ))
                })?;
                Ok(SchemaVersion {
                    fields: serde_json::from_str(&fields)?,
                    created_at: parse_timestamp(&created)?,
                    schema_id,
                    database_name,
                    table_name,
                    version,
                    source_definition: source,
                    source_format,
                    root_message: root,
                    previous_schema_id: previous,
                })
            })
            .collect()
    }

    /// Logical schemas with their version chains
    pub fn load_logical_schemas(&self) -> Result<Vec<LogicalSchema>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            r#"
            SELECT database_name, table_name, current_schema_id, retired, created_at, updated_at
            FROM schemas
            ORDER BY database_name, table_name
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut versions_stmt = db.prepare(
            "SELECT schema_id FROM schema_versions \
             WHERE database_name = ?1 AND table_name = ?2 ORDER BY version",
        )?;

        let mut schemas = Vec::with_capacity(rows.len());
        for (database_name, table_name, current_schema_id, retired, created, updated) in rows {
            let version_ids = versions_stmt
                .query_map(params![database_name, table_name], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            schemas.push(LogicalSchema {
                database_name,
                table_name,
                current_schema_id,
                version_ids,
                retired,
                created_at: parse_timestamp(&created)?,
                updated_at: parse_timestamp(&updated)?,
            });
        }
        Ok(schemas)
    }

    pub fn upsert_binding(&self, binding: &EngineTableBinding) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            r#"
            INSERT OR REPLACE INTO engine_table_bindings
            (schema_id, engine, mode, ddl, created, error, job_id, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                binding.schema_id,
                binding.engine.as_str(),
                binding.mode.as_str(),
                binding.ddl,
                binding.created,
                binding.error,
                binding.job_id,
                format_timestamp(&binding.updated_at),
            ],
        )
        .map_err(|e| BqError::Database(format!("Failed to persist table binding: {}", e)))?;
        Ok(())
    }

    pub fn load_bindings(&self) -> Result<Vec<EngineTableBinding>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT schema_id, engine, mode, ddl, created, error, job_id, updated_at \
             FROM engine_table_bindings",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|row| -> Result<EngineTableBinding> {
                let (schema_id, engine, mode, ddl, created, error, job_id, updated) = row;
                Ok(EngineTableBinding {
                    engine: engine
                        .parse::<EngineKind>()
                        .map_err(|e| BqError::Database(format!("binding {}: {}", schema_id, e)))?,
                    mode: TranslateMode::parse(&mode).ok_or_else(|| {
                        BqError::Database(format!("binding {}: unknown mode '{}'", schema_id, mode))
                    })?,
                    updated_at: parse_timestamp(&updated)?,
                    schema_id,
                    ddl,
                    created,
                    error,
                    job_id,
                })
            })
            .collect()
    }
}

fn upsert_logical(db: &Connection, logical: &LogicalSchema) -> Result<()> {
    db.execute(
        r#"
        INSERT INTO schemas
        (database_name, table_name, current_schema_id, retired, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(database_name, table_name) DO UPDATE SET
            current_schema_id = excluded.current_schema_id,
            retired = excluded.retired,
            updated_at = excluded.updated_at
        "#,
        params![
            logical.database_name,
            logical.table_name,
            logical.current_schema_id,
            logical.retired,
            format_timestamp(&logical.created_at),
            format_timestamp(&logical.updated_at),
        ],
    )
    .map_err(|e| {
        BqError::Database(format!(
            "Failed to save schema {}.{}: {}",
            logical.database_name, logical.table_name, e
        ))
    })?;
    Ok(())
}
