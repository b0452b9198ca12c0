//! Distributed adapter against a stub of the ClickHouse HTTP interface

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bqlite::config::DistributedConfig;
use bqlite::execution::{DistributedEngine, EngineAdapter, EngineError, EngineKind};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Stub {
    statements: Mutex<Vec<String>>,
    query_ids: Mutex<Vec<String>>,
    users: Mutex<Vec<String>>,
}

impl Stub {
    fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

async fn ping() -> &'static str {
    "Ok.\n"
}

async fn statement(
    State(stub): State<Arc<Stub>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    sql: String,
) -> Response {
    stub.statements.lock().unwrap().push(sql.clone());
    if let Some(query_id) = params.get("query_id") {
        stub.query_ids.lock().unwrap().push(query_id.clone());
    }
    if let Some(user) = headers.get("X-ClickHouse-User").and_then(|v| v.to_str().ok()) {
        stub.users.lock().unwrap().push(user.to_string());
    }

    if sql.starts_with("SLEEP") {
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
    if sql.starts_with("BAD") {
        return (
            StatusCode::BAD_REQUEST,
            "Code: 62. DB::Exception: Syntax error: failed at position 1",
        )
            .into_response();
    }
    if sql.starts_with("SELECT") {
        let body = json!({
            "meta": [{"name": "id", "type": "Int64"}, {"name": "name", "type": "String"}],
            "data": [[1, "a"], [2, "b"]],
            "rows": 2,
            "statistics": {"elapsed": 0.001, "rows_read": 2, "bytes_read": 32}
        });
        return body.to_string().into_response();
    }
    if sql.starts_with("DESCRIBE") {
        let body = json!({
            "meta": [{"name": "name", "type": "String"}, {"name": "type", "type": "String"}],
            "data": [
                ["name", "String", "", "", "", "", ""],
                ["visits", "Nullable(Int64)", "", "", "", "", ""]
            ],
            "rows": 2
        });
        return body.to_string().into_response();
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        "x-clickhouse-summary",
        r#"{"read_rows":"0","written_rows":"3","written_bytes":"120"}"#.parse().unwrap(),
    );
    (headers, "").into_response()
}

async fn start_stub() -> (Arc<Stub>, String) {
    let stub = Arc::new(Stub::default());
    let app = Router::new()
        .route("/ping", get(ping))
        .route("/", post(statement))
        .with_state(stub.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (stub, format!("http://{}", addr))
}

async fn engine() -> (Arc<Stub>, DistributedEngine) {
    let (stub, url) = start_stub().await;
    let engine = DistributedEngine::new(DistributedConfig {
        url,
        user: "reader".to_string(),
        password: "secret".to_string(),
        databases: vec!["bigquery_lite".to_string()],
        connect_timeout: Duration::from_secs(2),
    })
    .unwrap();
    engine.initialize().await.unwrap();
    (stub, engine)
}

#[tokio::test]
async fn test_initialize_creates_databases() {
    let (stub, engine) = engine().await;
    assert!(engine.health_check().await);
    assert_eq!(
        stub.statements(),
        vec!["CREATE DATABASE IF NOT EXISTS `bigquery_lite`"]
    );
    assert_eq!(stub.users.lock().unwrap()[0], "reader");
}

#[tokio::test]
async fn test_select_parses_compact_json() {
    let (_, engine) = engine().await;
    let result = engine
        .execute("SELECT id, name FROM t", Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(result.engine, EngineKind::Distributed);
    assert_eq!(result.row_count, 2);
    assert_eq!(result.columns[0].name, "id");
    assert_eq!(result.columns[0].data_type, "Int64");
    assert_eq!(result.rows[1], vec![json!(2), json!("b")]);
    assert_eq!(result.engine_metrics.get("rows_read"), Some(&json!(2)));
}

#[tokio::test]
async fn test_insert_reports_written_rows() {
    let (_, engine) = engine().await;
    let result = engine
        .execute("INSERT INTO t VALUES (1), (2), (3)", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.columns.is_empty());
    assert_eq!(result.row_count, 3);
    assert_eq!(result.engine_metrics.get("written_bytes"), Some(&json!(120)));
}

#[tokio::test]
async fn test_server_error_is_execution_error() {
    let (_, engine) = engine().await;
    let err = engine.execute("BAD SQL", Duration::from_secs(5)).await.unwrap_err();
    match err {
        EngineError::Execution(message) => assert!(message.contains("Syntax error")),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_kills_query() {
    let (stub, engine) = engine().await;
    let err = engine
        .execute("SLEEP", Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)));

    let query_id = stub.query_ids.lock().unwrap().last().cloned().unwrap();
    let mut killed = false;
    for _ in 0..50 {
        if stub
            .statements()
            .iter()
            .any(|s| s.starts_with("KILL QUERY") && s.contains(&query_id))
        {
            killed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(killed, "no KILL QUERY for {}", query_id);
}

#[tokio::test]
async fn test_describe_table_reports_nullability() {
    let (_, engine) = engine().await;
    let columns = engine.describe_table("bigquery_lite", "events").await.unwrap();
    assert_eq!(columns.len(), 2);
    assert_eq!(columns[0].name, "name");
    assert!(!columns[0].nullable);
    assert_eq!(columns[1].data_type, "Nullable(Int64)");
    assert!(columns[1].nullable);
}

#[tokio::test]
async fn test_shutdown_marks_unhealthy() {
    let (_, engine) = engine().await;
    engine.shutdown().await;
    assert!(!engine.health_check().await);
}
