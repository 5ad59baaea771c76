//! Execution Layer
//!
//! Engine contract, result type, the policy-enforcing executor, and the
//! SQLite and PostgreSQL engines behind it.

pub mod engine;
pub mod executor;
pub mod postgres_engine;
pub mod result;
pub mod sqlite_engine;

pub use engine::{ExecutionEngine, ExecutionError, ExecutionErrorKind, FetchRequest, FetchedRows};
pub use executor::QueryExecutor;
pub use postgres_engine::PostgresEngine;
pub use result::{ColumnMeta, QueryResult, Value};
pub use sqlite_engine::{PoolStats, SqliteEngine};

use crate::error::redact_credentials;
use crate::schema::SchemaProvider;
use std::sync::Arc;

/// A connected database seen as an engine and as a catalog.
#[derive(Clone)]
pub struct Database {
    pub engine: Arc<dyn ExecutionEngine>,
    pub catalog: Arc<dyn SchemaProvider>,
}

/// Connect by URL scheme: `sqlite://path` (or a bare file path) and
/// `postgres://` / `postgresql://`.
pub async fn connect(url: &str, pool_size: usize) -> Result<Database, ExecutionError> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let engine = Arc::new(PostgresEngine::connect(url, pool_size).await?);
        return Ok(Database {
            engine: engine.clone(),
            catalog: engine,
        });
    }

    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    if path.contains("://") {
        return Err(ExecutionError::connection(format!(
            "unsupported database URL '{}'",
            redact_credentials(url)
        )));
    }

    let engine = Arc::new(SqliteEngine::open(path, pool_size)?);
    Ok(Database {
        engine: engine.clone(),
        catalog: engine,
    })
}
