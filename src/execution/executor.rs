//! Query Executor
//!
//! Runs a [`ValidatedQuery`] under the execution policy: wall-clock timeout,
//! row cap and truncation detection.

use super::engine::{ExecutionEngine, ExecutionError, FetchRequest};
use super::result::QueryResult;
use crate::config::ExecutionPolicy;
use crate::sql::ValidatedQuery;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct QueryExecutor {
    engine: Arc<dyn ExecutionEngine>,
    policy: ExecutionPolicy,
}

impl QueryExecutor {
    pub fn new(engine: Arc<dyn ExecutionEngine>, policy: ExecutionPolicy) -> Self {
        Self { engine, policy }
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Execute a validated query.
    ///
    /// The engine enforces the timeout itself; this call additionally gives up
    /// after `query_timeout + cancel_grace`. Zero rows is an empty result.
    pub async fn execute(&self, query: &ValidatedQuery) -> Result<QueryResult, ExecutionError> {
        let started = Instant::now();
        let row_cap = query.row_cap();
        let request = FetchRequest {
            sql: query.execution_sql(),
            timeout: self.policy.query_timeout,
            max_rows: row_cap.saturating_add(1),
        };
        debug!(engine = self.engine.name(), sql = %request.sql, "Executing query");

        let hard_limit = self.policy.query_timeout + self.policy.cancel_grace;
        let fetched = match tokio::time::timeout(hard_limit, self.engine.fetch(request)).await {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(err)) => {
                warn!(engine = self.engine.name(), kind = %err.kind, message = %err.message, "Query failed");
                return Err(err);
            }
            Err(_) => {
                warn!(engine = self.engine.name(), "Query abandoned after timeout and grace period");
                return Err(ExecutionError::timeout(self.policy.query_timeout));
            }
        };

        let mut rows = fetched.rows;
        let truncated = rows.len() > row_cap;
        rows.truncate(row_cap);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            engine = self.engine.name(),
            rows = rows.len(),
            truncated,
            elapsed_ms,
            "Query executed"
        );
        Ok(QueryResult::new(fetched.columns, rows, elapsed_ms, truncated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::engine::{ExecutionErrorKind, FetchedRows};
    use crate::execution::result::{ColumnMeta, Value};
    use crate::schema::{SchemaSnapshot, TableSchema};
    use crate::sql::SqlSafetyValidator;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Returns `total` rows (bounded by the request) and records the SQL it saw
    struct FakeEngine {
        total: usize,
        delay: Duration,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExecutionEngine for FakeEngine {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn fetch(&self, request: FetchRequest) -> Result<FetchedRows, ExecutionError> {
            self.seen.lock().unwrap().push(request.sql.clone());
            tokio::time::sleep(self.delay).await;
            Ok(FetchedRows {
                columns: vec![ColumnMeta::new("n", Some("INTEGER"))],
                rows: (0..self.total.min(request.max_rows))
                    .map(|i| vec![Value::Int(i as i64)])
                    .collect(),
            })
        }

        async fn health_check(&self) -> Result<String, ExecutionError> {
            Ok("fake 1.0".to_string())
        }
    }

    fn validator(max_rows: usize) -> SqlSafetyValidator {
        let schema = SchemaSnapshot::new(vec![TableSchema::new("Numbers").column("n", "INTEGER", false)]);
        SqlSafetyValidator::new(Arc::new(schema), max_rows)
    }

    fn executor(engine: Arc<FakeEngine>, timeout: Duration) -> QueryExecutor {
        QueryExecutor::new(
            engine,
            ExecutionPolicy {
                max_rows: 10,
                query_timeout: timeout,
                cancel_grace: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test]
    async fn test_truncates_at_cap() {
        let engine = Arc::new(FakeEngine {
            total: 50,
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        });
        let query = validator(10).validate("SELECT n FROM Numbers").unwrap();
        let result = executor(engine.clone(), Duration::from_secs(5)).execute(&query).await.unwrap();

        assert_eq!(result.row_count(), 10);
        assert!(result.truncated());
        assert_eq!(engine.seen.lock().unwrap()[0], "SELECT TOP 11 n FROM Numbers");
    }

    #[tokio::test]
    async fn test_exact_fit_is_not_truncated() {
        let engine = Arc::new(FakeEngine {
            total: 10,
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        });
        let query = validator(10).validate("SELECT n FROM Numbers").unwrap();
        let result = executor(engine, Duration::from_secs(5)).execute(&query).await.unwrap();
        assert_eq!(result.row_count(), 10);
        assert!(!result.truncated());
    }

    #[tokio::test]
    async fn test_zero_rows_is_an_empty_table() {
        let engine = Arc::new(FakeEngine {
            total: 0,
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        });
        let query = validator(10).validate("SELECT TOP 3 n FROM Numbers").unwrap();
        let result = executor(engine, Duration::from_secs(5)).execute(&query).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.column_names(), vec!["n"]);
    }

    #[tokio::test]
    async fn test_unresponsive_engine_times_out_within_grace() {
        let engine = Arc::new(FakeEngine {
            total: 1,
            delay: Duration::from_secs(60),
            seen: Mutex::new(Vec::new()),
        });
        let query = validator(10).validate("SELECT n FROM Numbers").unwrap();
        let started = Instant::now();
        let err = executor(engine, Duration::from_millis(100))
            .execute(&query)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
