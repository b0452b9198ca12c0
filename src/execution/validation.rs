//! SQL Validation - advisory parse check per engine dialect
//!
//! Validation never blocks submission; the engines stay the authority on what
//! they accept.

use crate::execution::engine::EngineKind;
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::{ClickHouseDialect, Dialect, SQLiteDialect};
use sqlparser::parser::Parser;

/// Outcome of validating one SQL text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub engine: EngineKind,
    pub valid: bool,
    /// Kind of each parsed statement, in order
    pub statement_kinds: Vec<String>,
    pub error: Option<String>,
}

fn dialect_for(engine: EngineKind) -> Box<dyn Dialect> {
    match engine {
        EngineKind::Embedded => Box::new(SQLiteDialect {}),
        EngineKind::Distributed => Box::new(ClickHouseDialect {}),
    }
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Query(_) => "SELECT",
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::CreateTable { .. } => "CREATE_TABLE",
        Statement::CreateView { .. } => "CREATE_VIEW",
        Statement::CreateSchema { .. } | Statement::CreateDatabase { .. } => "CREATE_DATABASE",
        Statement::AlterTable { .. } => "ALTER_TABLE",
        Statement::Drop { .. } => "DROP",
        Statement::Explain { .. } => "EXPLAIN",
        _ => "OTHER",
    }
}

/// Parse `sql` with the dialect of `engine`
pub fn validate_sql(sql: &str, engine: EngineKind) -> ValidationReport {
    if sql.trim().is_empty() {
        return ValidationReport {
            engine,
            valid: false,
            statement_kinds: Vec::new(),
            error: Some("SQL text is empty".to_string()),
        };
    }

    let dialect = dialect_for(engine);
    match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(statements) => ValidationReport {
            engine,
            valid: true,
            statement_kinds: statements
                .iter()
                .map(|s| statement_kind(s).to_string())
                .collect(),
            error: None,
        },
        Err(e) => {
            tracing::debug!("SQL failed {} dialect validation: {}", engine, e);
            ValidationReport {
                engine,
                valid: false,
                statement_kinds: Vec::new(),
                error: Some(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_select() {
        let report = validate_sql("SELECT a, count(*) FROM t GROUP BY a", EngineKind::Embedded);
        assert!(report.valid);
        assert_eq!(report.statement_kinds, vec!["SELECT"]);
    }

    #[test]
    fn test_multiple_statements() {
        let report = validate_sql(
            "CREATE TABLE t (a INTEGER); INSERT INTO t VALUES (1)",
            EngineKind::Embedded,
        );
        assert!(report.valid);
        assert_eq!(report.statement_kinds, vec!["CREATE_TABLE", "INSERT"]);
    }

    #[test]
    fn test_invalid_sql_reports_error() {
        let report = validate_sql("SELECT FROM WHERE", EngineKind::Distributed);
        assert!(!report.valid);
        assert!(report.error.is_some());

        let empty = validate_sql("   ", EngineKind::Distributed);
        assert!(!empty.valid);
    }
}
