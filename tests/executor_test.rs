use bi_agent::config::ExecutionPolicy;
use bi_agent::execution::{ExecutionEngine, ExecutionErrorKind, QueryExecutor, SqliteEngine};
use bi_agent::schema::SchemaProvider;
use bi_agent::sql::SqlSafetyValidator;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn products_db(dir: &TempDir, rows: usize) -> PathBuf {
    let path = dir.path().join("products.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("CREATE TABLE Products (Product_Name TEXT NOT NULL, Price REAL NOT NULL);")
        .unwrap();
    conn.execute(
        "INSERT INTO Products (Product_Name, Price)
         SELECT 'Product ' || i, i * 1.5
         FROM (WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < ?1) SELECT i FROM n)",
        [rows as i64],
    )
    .unwrap();
    path
}

async fn validator(engine: &SqliteEngine, max_rows: usize) -> SqlSafetyValidator {
    let snapshot = engine.load_schema().await.unwrap();
    SqlSafetyValidator::new(Arc::new(snapshot), max_rows)
}

fn policy(max_rows: usize, timeout: Duration) -> ExecutionPolicy {
    ExecutionPolicy {
        max_rows,
        query_timeout: timeout,
        cancel_grace: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_runaway_query_times_out_and_releases_connection() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(SqliteEngine::open(products_db(&dir, 50_000), 1).unwrap());
    let query = validator(&engine, 1000)
        .await
        .validate("SELECT COUNT(*) FROM Products a CROSS JOIN Products b")
        .unwrap();

    let timeout = Duration::from_millis(200);
    let executor = QueryExecutor::new(engine.clone(), policy(1000, timeout));

    let started = Instant::now();
    let err = executor.execute(&query).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind, ExecutionErrorKind::Timeout);
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(3), "took {:?}", elapsed);

    let stats = engine.pool_stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, stats.opened);

    // The single pooled connection is usable again
    let follow_up = validator(&engine, 1000)
        .await
        .validate("SELECT TOP 3 Product_Name FROM Products")
        .unwrap();
    let result = executor.execute(&follow_up).await.unwrap();
    assert_eq!(result.row_count(), 3);
}

#[tokio::test]
async fn test_unbounded_select_is_capped_and_truncated() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(SqliteEngine::open(products_db(&dir, 50_000), 2).unwrap());
    let query = validator(&engine, 1000).await.validate("SELECT * FROM Products").unwrap();
    assert_eq!(query.sql(), "SELECT TOP 1000 * FROM Products");

    let executor = QueryExecutor::new(engine.clone(), policy(1000, Duration::from_secs(10)));
    let result = executor.execute(&query).await.unwrap();

    assert_eq!(result.row_count(), 1000);
    assert!(result.truncated());
    assert_eq!(engine.pool_stats().in_use, 0);
}

#[tokio::test]
async fn test_zero_rows_is_an_empty_result() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(SqliteEngine::open(products_db(&dir, 10), 1).unwrap());
    let query = validator(&engine, 1000)
        .await
        .validate("SELECT Product_Name FROM Products WHERE Price < 0")
        .unwrap();

    let executor = QueryExecutor::new(engine, policy(1000, Duration::from_secs(10)));
    let result = executor.execute(&query).await.unwrap();

    assert!(result.is_empty());
    assert!(!result.truncated());
    assert_eq!(result.column_names(), vec!["Product_Name"]);
}

#[tokio::test]
async fn test_dropped_execution_releases_connection() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(SqliteEngine::open(products_db(&dir, 50_000), 1).unwrap());
    let query = validator(&engine, 1000)
        .await
        .validate("SELECT COUNT(*) FROM Products a CROSS JOIN Products b")
        .unwrap();
    let executor = QueryExecutor::new(engine.clone(), policy(1000, Duration::from_secs(30)));

    // Abandon the call the way a cancelled pipeline stage does
    let abandoned = tokio::time::timeout(Duration::from_millis(100), executor.execute(&query)).await;
    assert!(abandoned.is_err());

    let deadline = Instant::now() + Duration::from_secs(3);
    while engine.pool_stats().in_use > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(engine.pool_stats().in_use, 0);
    assert!(engine.health_check().await.unwrap().starts_with("SQLite"));
}
