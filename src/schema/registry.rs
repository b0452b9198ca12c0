//! Schema Registry
//!
//! Versions are immutable nodes keyed by their schema id; each logical schema
//! (database, table) keeps an ordered version chain plus a "current" pointer.
//! Writes for one logical schema are serialized by a per-key lock and persisted
//! before the in-memory maps change, so a failed write leaves nothing behind.
//! Reads are lock-free snapshots.

use crate::config::DEFAULT_DATABASE;
use crate::db::MetadataStore;
use crate::error::{BqError, Result};
use crate::execution::EngineKind;
use crate::schema::compat::{check_compatibility, CompatibilityReport};
use crate::schema::field::{compute_schema_id, validate_fields, Field};
use crate::schema::parser::{SchemaParser, SourceFormat};
use crate::schema::proto::{parse_proto, ProtoSchema};
use crate::schema::translator::{self, default_mode, TableDdl, TranslateMode};
use crate::schema::validate_identifier;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

type SchemaKey = (String, String);

/// One immutable registered version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub schema_id: String,
    pub database_name: String,
    pub table_name: String,
    /// 1-based position in the version chain
    pub version: u32,
    pub fields: Vec<Field>,
    pub source_definition: String,
    pub source_format: SourceFormat,
    pub root_message: Option<String>,
    pub previous_schema_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SchemaVersion {
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn has_nested(&self) -> bool {
        self.fields.iter().any(|f| f.field_type.is_record())
    }
}

/// Version chain of one (database, table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalSchema {
    pub database_name: String,
    pub table_name: String,
    pub current_schema_id: String,
    /// Oldest first
    pub version_ids: Vec<String>,
    pub retired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of `register`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub schema_id: String,
    pub database_name: String,
    pub table_name: String,
    pub version: u32,
    pub field_count: usize,
    /// False when an identical definition was already registered
    pub created: bool,
}

/// Current version of a live logical schema
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSummary {
    pub schema_id: String,
    pub database_name: String,
    pub table_name: String,
    pub version: u32,
    pub version_count: usize,
    pub field_count: usize,
    pub has_nested: bool,
    pub source_format: SourceFormat,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// DDL execution state of a schema on one engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineTableBinding {
    pub schema_id: String,
    pub engine: EngineKind,
    pub mode: TranslateMode,
    pub ddl: String,
    pub created: bool,
    pub error: Option<String>,
    pub job_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub struct SchemaRegistry {
    store: Arc<MetadataStore>,
    parser: Arc<dyn SchemaParser>,
    versions: DashMap<String, Arc<SchemaVersion>>,
    schemas: DashMap<SchemaKey, LogicalSchema>,
    write_locks: DashMap<SchemaKey, Arc<Mutex<()>>>,
    bindings: DashMap<(String, EngineKind), EngineTableBinding>,
}

impl SchemaRegistry {
    /// Registry backed by `store`, loaded with everything persisted there
    pub fn new(store: Arc<MetadataStore>, parser: Arc<dyn SchemaParser>) -> Result<Self> {
        let registry = Self {
            store,
            parser,
            versions: DashMap::new(),
            schemas: DashMap::new(),
            write_locks: DashMap::new(),
            bindings: DashMap::new(),
        };

        for version in registry.store.load_schema_versions()? {
            registry
                .versions
                .insert(version.schema_id.clone(), Arc::new(version));
        }
        for logical in registry.store.load_logical_schemas()? {
            let key = (logical.database_name.clone(), logical.table_name.clone());
            registry.schemas.insert(key, logical);
        }
        for binding in registry.store.load_bindings()? {
            registry
                .bindings
                .insert((binding.schema_id.clone(), binding.engine), binding);
        }

        info!(
            "Schema registry loaded: {} logical schemas, {} versions, {} bindings",
            registry.schemas.len(),
            registry.versions.len(),
            registry.bindings.len()
        );
        Ok(registry)
    }

    /// Register a source definition for `database.table`
    ///
    /// Registering a definition whose canonical tree matches an existing
    /// version returns that version's id without writing a new version; if it
    /// is not the current one, the current pointer moves back to it.
    pub fn register(
        &self,
        source_definition: &str,
        table_name: &str,
        database_name: Option<&str>,
    ) -> Result<Registration> {
        let database_name = database_name.unwrap_or(DEFAULT_DATABASE);
        validate_identifier(database_name)?;
        validate_identifier(table_name)?;

        let parsed = self.parser.parse(source_definition)?;
        validate_fields(&parsed.fields)?;
        let schema_id = compute_schema_id(database_name, table_name, &parsed.fields);

        let key: SchemaKey = (database_name.to_string(), table_name.to_string());
        let lock = self.write_locks.entry(key.clone()).or_default().value().clone();
        let _guard = lock.lock().map_err(|_| {
            BqError::Execution(format!(
                "registration lock for {}.{} poisoned",
                database_name, table_name
            ))
        })?;

        let now = Utc::now();
        let existing = self.schemas.get(&key).map(|s| s.value().clone());

        if let Some(version) = self.versions.get(&schema_id).map(|v| v.value().clone()) {
            if let Some(mut logical) = existing {
                if logical.current_schema_id != schema_id || logical.retired {
                    logical.current_schema_id = schema_id.clone();
                    logical.retired = false;
                    logical.updated_at = now;
                    self.store.save_logical_schema(&logical)?;
                    info!(
                        "Schema {}.{} current version reset to v{} ({})",
                        database_name, table_name, version.version, schema_id
                    );
                    self.schemas.insert(key, logical);
                }
            }
            debug!("Schema {} already registered", schema_id);
            return Ok(Registration {
                schema_id,
                database_name: database_name.to_string(),
                table_name: table_name.to_string(),
                version: version.version,
                field_count: version.field_count(),
                created: false,
            });
        }

        let version = SchemaVersion {
            schema_id: schema_id.clone(),
            database_name: database_name.to_string(),
            table_name: table_name.to_string(),
            version: existing.as_ref().map_or(1, |s| s.version_ids.len() as u32 + 1),
            fields: parsed.fields,
            source_definition: source_definition.to_string(),
            source_format: parsed.format,
            root_message: parsed.root_message,
            previous_schema_id: existing.as_ref().map(|s| s.current_schema_id.clone()),
            created_at: now,
        };

        let mut logical = existing.unwrap_or_else(|| LogicalSchema {
            database_name: database_name.to_string(),
            table_name: table_name.to_string(),
            current_schema_id: schema_id.clone(),
            version_ids: Vec::new(),
            retired: false,
            created_at: now,
            updated_at: now,
        });
        logical.current_schema_id = schema_id.clone();
        logical.version_ids.push(schema_id.clone());
        logical.retired = false;
        logical.updated_at = now;

        self.store.insert_schema_version(&version, &logical)?;

        info!(
            "Registered schema {}.{} v{} ({}, {} fields)",
            database_name,
            table_name,
            version.version,
            schema_id,
            version.field_count()
        );

        let registration = Registration {
            schema_id: schema_id.clone(),
            database_name: database_name.to_string(),
            table_name: table_name.to_string(),
            version: version.version,
            field_count: version.field_count(),
            created: true,
        };
        self.versions.insert(schema_id, Arc::new(version));
        self.schemas.insert(key, logical);
        Ok(registration)
    }

    pub fn get(&self, schema_id: &str) -> Result<Arc<SchemaVersion>> {
        self.versions
            .get(schema_id)
            .map(|v| v.value().clone())
            .ok_or_else(|| BqError::NotFound(format!("schema '{}'", schema_id)))
    }

    fn logical(&self, database_name: &str, table_name: &str) -> Result<LogicalSchema> {
        self.schemas
            .get(&(database_name.to_string(), table_name.to_string()))
            .map(|s| s.value().clone())
            .ok_or_else(|| {
                BqError::NotFound(format!("schema for {}.{}", database_name, table_name))
            })
    }

    /// Current version of a live logical schema
    pub fn current(&self, database_name: &str, table_name: &str) -> Result<Arc<SchemaVersion>> {
        let logical = self.logical(database_name, table_name)?;
        if logical.retired {
            return Err(BqError::NotFound(format!(
                "schema for {}.{} was deregistered",
                database_name, table_name
            )));
        }
        self.get(&logical.current_schema_id)
    }

    /// Every version of a logical schema, oldest first
    pub fn versions(
        &self,
        database_name: &str,
        table_name: &str,
    ) -> Result<Vec<Arc<SchemaVersion>>> {
        let logical = self.logical(database_name, table_name)?;
        logical.version_ids.iter().map(|id| self.get(id)).collect()
    }

    /// Version chain containing `schema_id`
    pub fn versions_for_schema(&self, schema_id: &str) -> Result<Vec<Arc<SchemaVersion>>> {
        let version = self.get(schema_id)?;
        self.versions(&version.database_name, &version.table_name)
    }

    /// Current version of each live logical schema
    pub fn list(&self) -> Vec<SchemaSummary> {
        self.schemas
            .iter()
            .filter(|entry| !entry.retired)
            .filter_map(|entry| {
                let logical = entry.value();
                let current = self.versions.get(&logical.current_schema_id)?;
                Some(SchemaSummary {
                    schema_id: current.schema_id.clone(),
                    database_name: logical.database_name.clone(),
                    table_name: logical.table_name.clone(),
                    version: current.version,
                    version_count: logical.version_ids.len(),
                    field_count: current.field_count(),
                    has_nested: current.has_nested(),
                    source_format: current.source_format,
                    created_at: logical.created_at,
                    updated_at: logical.updated_at,
                })
            })
            .sorted_by(|a, b| {
                (a.database_name.as_str(), a.table_name.as_str())
                    .cmp(&(b.database_name.as_str(), b.table_name.as_str()))
            })
            .collect()
    }

    /// Retire a logical schema; its versions stay readable by id
    pub fn deregister(&self, database_name: &str, table_name: &str) -> Result<()> {
        let key: SchemaKey = (database_name.to_string(), table_name.to_string());
        let lock = self.write_locks.entry(key.clone()).or_default().value().clone();
        let _guard = lock.lock().map_err(|_| {
            BqError::Execution(format!(
                "registration lock for {}.{} poisoned",
                database_name, table_name
            ))
        })?;

        let mut logical = self.logical(database_name, table_name)?;
        if logical.retired {
            return Err(BqError::NotFound(format!(
                "schema for {}.{} was already deregistered",
                database_name, table_name
            )));
        }
        logical.retired = true;
        logical.updated_at = Utc::now();
        self.store.save_logical_schema(&logical)?;
        self.schemas.insert(key, logical);

        info!("Deregistered schema {}.{}", database_name, table_name);
        Ok(())
    }

    /// Advisory comparison of two registered versions
    pub fn check_compatibility(
        &self,
        old_schema_id: &str,
        new_schema_id: &str,
    ) -> Result<CompatibilityReport> {
        let old = self.get(old_schema_id)?;
        let new = self.get(new_schema_id)?;
        Ok(check_compatibility(old_schema_id, &old.fields, new_schema_id, &new.fields))
    }

    /// Translate mode in effect for a schema on an engine
    pub fn mode_for(&self, schema_id: &str, engine: EngineKind) -> TranslateMode {
        self.binding(schema_id, engine)
            .map(|b| b.mode)
            .unwrap_or_else(|| default_mode(engine))
    }

    /// CREATE TABLE for a registered version
    pub fn translate(
        &self,
        schema_id: &str,
        engine: EngineKind,
        mode: Option<TranslateMode>,
        if_not_exists: bool,
    ) -> Result<TableDdl> {
        let version = self.get(schema_id)?;
        translator::translate_fields(
            &version.fields,
            &version.database_name,
            &version.table_name,
            engine,
            mode.unwrap_or_else(|| default_mode(engine)),
            if_not_exists,
        )
    }

    /// Flattened view over the nested table, None without RECORD fields
    pub fn flattened_view_sql(
        &self,
        schema_id: &str,
        engine: EngineKind,
    ) -> Result<Option<String>> {
        let version = self.get(schema_id)?;
        translator::flattened_view_sql(
            &version.fields,
            &version.database_name,
            &version.table_name,
            engine,
        )
    }

    pub fn record_binding(&self, binding: EngineTableBinding) -> Result<()> {
        self.get(&binding.schema_id)?;
        self.store.upsert_binding(&binding)?;
        self.bindings
            .insert((binding.schema_id.clone(), binding.engine), binding);
        Ok(())
    }

    pub fn binding(&self, schema_id: &str, engine: EngineKind) -> Option<EngineTableBinding> {
        self.bindings
            .get(&(schema_id.to_string(), engine))
            .map(|b| b.value().clone())
    }

    /// Bindings of a schema, in engine order
    pub fn bindings(&self, schema_id: &str) -> Vec<EngineTableBinding> {
        EngineKind::ALL
            .iter()
            .filter_map(|engine| self.binding(schema_id, *engine))
            .collect()
    }

    /// Resolved protobuf descriptor of a version registered from `.proto` text
    pub fn proto_schema(&self, schema_id: &str) -> Result<(Arc<SchemaVersion>, ProtoSchema)> {
        let version = self.get(schema_id)?;
        if version.source_format != SourceFormat::Proto {
            return Err(BqError::InvalidRequest(format!(
                "schema '{}' was registered from {} and has no protobuf descriptor",
                schema_id,
                version.source_format.as_str()
            )));
        }
        let proto = parse_proto(&version.source_definition)?;
        Ok((version, proto))
    }
}
