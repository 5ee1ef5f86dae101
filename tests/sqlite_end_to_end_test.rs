use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use dbconduit::ConduitError;
use dbconduit::config::{DatabaseConfig, QueueConfig, ServerConfig};
use dbconduit::dispatch::{BatchItem, Dispatcher};
use dbconduit::engine::{DefaultDriverFactory, EngineKind};
use dbconduit::pending::PendingResultManager;
use dbconduit::queue::QueueManager;

const BOOTSTRAP_SQL: &str =
    "SELECT ref, query, name, queue, timeout, type FROM app_queries";

fn seed_database(path: &Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE app_queries (
            ref INTEGER PRIMARY KEY,
            query TEXT NOT NULL,
            name TEXT,
            queue TEXT,
            timeout INTEGER,
            type INTEGER
        );
        INSERT INTO app_queries VALUES
            (1, 'SELECT id, label, score FROM items WHERE id = :id', 'item-by-id', 'fast', 5, 0),
            (2, 'SELECT COUNT(*) AS n FROM items', 'item-count', 'medium', 5, 0),
            (3, 'SELECT id FROM missing_table', 'broken', 'slow', 5, 0),
            (4, 'INSERT INTO items (id, label, score) VALUES (:id, :label, :score)', 'item-insert', 'slow', 5, 0);

        CREATE TABLE items (
            id INTEGER PRIMARY KEY,
            label TEXT NOT NULL,
            score REAL
        );
        INSERT INTO items VALUES (1, 'one', 1.5), (2, 'two', NULL);
        "#,
    )
    .unwrap();
}

async fn start_stack(path: &Path) -> (Arc<QueueManager>, Dispatcher) {
    let mut db_cfg = DatabaseConfig::new("main", EngineKind::Sqlite, path.to_str().unwrap());
    db_cfg.bootstrap_query = Some(BOOTSTRAP_SQL.to_string());
    db_cfg.queues.medium = Some(QueueConfig::default());
    db_cfg.queues.fast = Some(QueueConfig::default());

    let mut cfg = ServerConfig::default();
    cfg.databases.push(db_cfg);

    let pending = Arc::new(PendingResultManager::new("pending-test"));
    let manager = Arc::new(
        QueueManager::start(&cfg, Arc::clone(&pending), Arc::new(DefaultDriverFactory)).unwrap(),
    );
    assert!(manager.wait_ready(Duration::from_secs(5)).await);
    let dispatcher = Dispatcher::new(Arc::clone(&manager), pending);
    (manager, dispatcher)
}

#[tokio::test]
async fn bootstrap_populates_cache_and_queries_execute() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.db");
    seed_database(&path);
    let (manager, dispatcher) = start_stack(&path).await;

    let runtime = manager.database("main").unwrap();
    assert_eq!(runtime.cache().entry_count(), 4);

    let result = dispatcher
        .submit_and_wait("main", 1, Some(&json!({"id": 2})), None)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.row_count, 1);
    let data: serde_json::Value = serde_json::from_str(&result.data_json).unwrap();
    // Numeric columns come back unquoted, NULL as JSON null.
    assert_eq!(data, json!([{"id": 2, "label": "two", "score": null}]));

    manager.shutdown().await;
}

#[tokio::test]
async fn unknown_database_and_ref_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.db");
    seed_database(&path);
    let (manager, dispatcher) = start_stack(&path).await;

    let err = dispatcher
        .submit_and_wait("elsewhere", 1, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConduitError::NotFound(_)));

    let err = dispatcher
        .submit_and_wait("main", 999, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConduitError::NotFound(_)));

    manager.shutdown().await;
}

#[tokio::test]
async fn parameter_validation_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.db");
    seed_database(&path);
    let (manager, dispatcher) = start_stack(&path).await;

    // Missing :id entirely.
    let err = dispatcher
        .submit_and_wait("main", 1, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConduitError::Validation(_)));

    // Unknown extra key.
    let err = dispatcher
        .submit_and_wait("main", 1, Some(&json!({"id": 1, "bogus": 2})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConduitError::Validation(_)));

    manager.shutdown().await;
}

#[tokio::test]
async fn engine_failure_completes_with_failed_result() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.db");
    seed_database(&path);
    let (manager, dispatcher) = start_stack(&path).await;

    // Ref 3 selects from a table that does not exist: the dispatch
    // succeeds, the result carries the engine error.
    let result = dispatcher.submit_and_wait("main", 3, None, None).await.unwrap();
    assert!(!result.success);
    assert!(result.error_message.is_some());
    assert_eq!(result.row_count, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn dml_reports_affected_rows_and_is_visible_afterwards() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.db");
    seed_database(&path);
    let (manager, dispatcher) = start_stack(&path).await;

    let insert = dispatcher
        .submit_and_wait(
            "main",
            4,
            Some(&json!({"id": 3, "label": "three", "score": 3.5})),
            None,
        )
        .await
        .unwrap();
    assert!(insert.success);
    assert_eq!(insert.affected_rows, 1);

    let count = dispatcher.submit_and_wait("main", 2, None, None).await.unwrap();
    let data: serde_json::Value = serde_json::from_str(&count.data_json).unwrap();
    assert_eq!(data, json!([{"n": 3}]));

    manager.shutdown().await;
}

#[tokio::test]
async fn batch_degrades_per_item_and_deduplicates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.db");
    seed_database(&path);
    let (manager, dispatcher) = start_stack(&path).await;

    let items = vec![
        BatchItem { query_ref: 2, params: None },
        BatchItem { query_ref: 3, params: None },
        BatchItem { query_ref: 999, params: None },
        // Duplicate of the first item: submitted once, answered twice.
        BatchItem { query_ref: 2, params: None },
    ];
    let response = dispatcher
        .submit_and_wait_many("main", &items, None)
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.results.len(), 4);
    assert_eq!(
        response.results.iter().map(|r| r.query_ref).collect::<Vec<_>>(),
        vec![2, 3, 999, 2]
    );
    assert!(response.results[0].success);
    assert!(!response.results[1].success);
    assert!(!response.results[2].success);
    assert!(response.results[3].success);
    assert_eq!(response.results[0].data, response.results[3].data);

    let json = response.to_json();
    assert_eq!(json["database"], json!("main"));
    assert_eq!(json["results"].as_array().unwrap().len(), 4);

    manager.shutdown().await;
}

#[tokio::test]
async fn batch_unique_query_limit_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.db");
    seed_database(&path);

    let mut db_cfg = DatabaseConfig::new("main", EngineKind::Sqlite, path.to_str().unwrap());
    db_cfg.bootstrap_query = Some(BOOTSTRAP_SQL.to_string());
    db_cfg.max_queries_per_request = 2;
    let mut cfg = ServerConfig::default();
    cfg.databases.push(db_cfg);

    let pending = Arc::new(PendingResultManager::new("pending-test"));
    let manager = Arc::new(
        QueueManager::start(&cfg, Arc::clone(&pending), Arc::new(DefaultDriverFactory)).unwrap(),
    );
    assert!(manager.wait_ready(Duration::from_secs(5)).await);
    let dispatcher = Dispatcher::new(Arc::clone(&manager), pending);

    let items = vec![
        BatchItem { query_ref: 1, params: Some(json!({"id": 1})) },
        BatchItem { query_ref: 2, params: None },
        BatchItem { query_ref: 3, params: None },
    ];
    let err = dispatcher
        .submit_and_wait_many("main", &items, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConduitError::Validation(_)));

    manager.shutdown().await;
}
