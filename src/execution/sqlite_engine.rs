//! SQLite Execution Engine
//!
//! Embedded engine over rusqlite. Connections are opened read-only with
//! `query_only` set and kept in a small bounded pool. Queries run on the
//! blocking thread pool; a timeout interrupts the statement and waits for the
//! connection to come back before reporting.

use super::engine::{ExecutionEngine, ExecutionError, ExecutionErrorKind, FetchRequest, FetchedRows};
use super::result::{ColumnMeta, Value};
use crate::schema::{ColumnSchema, SchemaError, SchemaProvider, SchemaSnapshot, TableSchema};
use crate::sql::dialect::top_to_limit;
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);
const CATALOG_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub opened: usize,
}

struct SqlitePool {
    path: PathBuf,
    size: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    in_use: AtomicUsize,
    opened: AtomicUsize,
}

impl SqlitePool {
    fn open_connection(&self) -> Result<Connection, ExecutionError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(&self.path, flags).map_err(|e| map_error(e, Phase::Open))?;
        conn.pragma_update(None, "query_only", true)
            .map_err(|e| map_error(e, Phase::Open))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| map_error(e, Phase::Open))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        debug!(path = %self.path.display(), "Opened SQLite connection");
        Ok(conn)
    }

    async fn acquire(self: &Arc<Self>, wait: Duration) -> Result<PooledConnection, ExecutionError> {
        let permit = tokio::time::timeout(wait, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| ExecutionError::connection("timed out waiting for a free SQLite connection"))?
            .map_err(|_| ExecutionError::connection("SQLite connection pool is closed"))?;

        let cached = self.lock_idle().pop();
        let conn = match cached {
            Some(conn) => conn,
            None => self.open_connection()?,
        };
        self.in_use.fetch_add(1, Ordering::SeqCst);

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            idle: self.lock_idle().len(),
            in_use: self.in_use.load(Ordering::SeqCst),
            opened: self.opened.load(Ordering::SeqCst),
        }
    }
}

/// Scoped connection; dropping it returns the connection and its permit.
struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<SqlitePool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn connection(&self) -> Result<&Connection, ExecutionError> {
        self.conn
            .as_ref()
            .ok_or_else(|| ExecutionError::unknown("pooled connection already released"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.lock_idle().push(conn);
        }
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Interrupt access to one borrowed connection. Interrupts are sent while
/// holding the lock and the worker clears `running` under the same lock
/// before it returns the connection, so a late interrupt cannot reach the
/// pool's next borrower.
struct QueryGate {
    handle: InterruptHandle,
    running: Mutex<bool>,
}

impl QueryGate {
    fn new(handle: InterruptHandle) -> Self {
        Self {
            handle,
            running: Mutex::new(true),
        }
    }

    /// Interrupt the statement if the worker still owns the connection.
    fn interrupt(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *running {
            self.handle.interrupt();
        }
        *running
    }

    fn finish(&self) {
        *self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = false;
    }
}

/// Interrupts the statement if the fetch future is dropped while it still runs.
struct InterruptOnDrop {
    gate: Arc<QueryGate>,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.gate.interrupt() {
            debug!("Fetch dropped mid-query, interrupted SQLite statement");
        }
    }
}

pub struct SqliteEngine {
    pool: Arc<SqlitePool>,
    cancel_grace: Duration,
}

impl SqliteEngine {
    /// Open `path` read-only with a pool of `pool_size` connections. One
    /// connection is opened eagerly so a bad path fails here.
    pub fn open(path: impl AsRef<Path>, pool_size: usize) -> Result<Self, ExecutionError> {
        let size = pool_size.max(1);
        let pool = Arc::new(SqlitePool {
            path: path.as_ref().to_path_buf(),
            size,
            permits: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(Vec::with_capacity(size)),
            in_use: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
        });
        let first = pool.open_connection()?;
        pool.lock_idle().push(first);
        info!(path = %path.as_ref().display(), pool_size = size, "SQLite engine ready");

        Ok(Self {
            pool,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        })
    }

    /// How long a timed-out query may take to acknowledge the interrupt
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[async_trait]
impl ExecutionEngine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn fetch(&self, request: FetchRequest) -> Result<FetchedRows, ExecutionError> {
        let sql = top_to_limit(&request.sql);
        let started = Instant::now();
        let pooled = self.pool.acquire(request.timeout).await?;
        let remaining = request.timeout.saturating_sub(started.elapsed());

        let gate = Arc::new(QueryGate::new(pooled.connection()?.get_interrupt_handle()));
        let _guard = InterruptOnDrop {
            gate: Arc::clone(&gate),
        };

        let max_rows = request.max_rows;
        let worker_gate = Arc::clone(&gate);
        let mut task = tokio::task::spawn_blocking(move || {
            let result = pooled.connection().and_then(|conn| run_query(conn, &sql, max_rows));
            worker_gate.finish();
            drop(pooled);
            result
        });

        match tokio::time::timeout(remaining, &mut task).await {
            Ok(joined) => joined.map_err(|e| ExecutionError::unknown(format!("query worker failed: {}", e)))?,
            Err(_) => {
                warn!(timeout_ms = request.timeout.as_millis() as u64, "SQLite query timed out, interrupting");
                // An interrupt that lands between statements is cleared by
                // SQLite, so keep signalling until the worker exits.
                let give_up = Instant::now() + self.cancel_grace;
                loop {
                    if !gate.interrupt() {
                        let _ = (&mut task).await;
                        break;
                    }
                    match tokio::time::timeout(Duration::from_millis(10), &mut task).await {
                        Ok(_) => break,
                        Err(_) if Instant::now() >= give_up => {
                            warn!("Interrupted SQLite query still running after grace period");
                            break;
                        }
                        Err(_) => {}
                    }
                }
                Err(ExecutionError::timeout(request.timeout))
            }
        }
    }

    async fn health_check(&self) -> Result<String, ExecutionError> {
        let pooled = self.pool.acquire(CATALOG_TIMEOUT).await?;
        tokio::task::spawn_blocking(move || {
            let conn = pooled.connection()?;
            conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0))
                .map(|version| format!("SQLite {}", version))
                .map_err(|e| map_error(e, Phase::Step))
        })
        .await
        .map_err(|e| ExecutionError::unknown(format!("health check worker failed: {}", e)))?
    }
}

#[async_trait]
impl SchemaProvider for SqliteEngine {
    async fn load_schema(&self) -> Result<SchemaSnapshot, SchemaError> {
        let pooled = self
            .pool
            .acquire(CATALOG_TIMEOUT)
            .await
            .map_err(|e| SchemaError::Unavailable(e.message))?;

        tokio::task::spawn_blocking(move || {
            let conn = pooled.connection().map_err(|e| SchemaError::Unavailable(e.message))?;
            read_catalog(conn).map_err(|e| SchemaError::Unavailable(e.to_string()))
        })
        .await
        .map_err(|e| SchemaError::Unavailable(format!("catalog worker failed: {}", e)))?
    }
}

fn read_catalog(conn: &Connection) -> rusqlite::Result<SchemaSnapshot> {
    let mut tables_stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )?;
    let names = tables_stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut columns_stmt =
        conn.prepare("SELECT name, type, \"notnull\" FROM pragma_table_info(?1) ORDER BY cid")?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let columns = columns_stmt
            .query_map([&name], |row| {
                Ok(ColumnSchema {
                    name: row.get(0)?,
                    data_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    nullable: row.get::<_, i64>(2)? == 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        tables.push(TableSchema {
            schema: None,
            name,
            columns,
        });
    }
    Ok(SchemaSnapshot::new(tables))
}

fn run_query(conn: &Connection, sql: &str, max_rows: usize) -> Result<FetchedRows, ExecutionError> {
    let mut stmt = conn.prepare(sql).map_err(|e| map_error(e, Phase::Prepare))?;
    if !stmt.readonly() {
        return Err(ExecutionError::new(
            ExecutionErrorKind::SyntaxRejectedByEngine,
            "statement would modify the database",
        ));
    }

    let columns: Vec<ColumnMeta> = stmt
        .columns()
        .iter()
        .map(|c| ColumnMeta::new(c.name(), c.decl_type()))
        .collect();
    let width = columns.len();

    let mut cursor = stmt.query([]).map_err(|e| map_error(e, Phase::Step))?;
    let mut rows = Vec::new();
    while rows.len() < max_rows {
        let row = match cursor.next().map_err(|e| map_error(e, Phase::Step))? {
            Some(row) => row,
            None => break,
        };
        let mut values = Vec::with_capacity(width);
        for index in 0..width {
            let cell = row.get_ref(index).map_err(|e| map_error(e, Phase::Step))?;
            values.push(convert(cell));
        }
        rows.push(values);
    }

    Ok(FetchedRows { columns, rows })
}

fn convert(cell: ValueRef<'_>) -> Value {
    match cell {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Prepare,
    Step,
}

fn map_error(err: rusqlite::Error, phase: Phase) -> ExecutionError {
    let kind = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::OperationInterrupted => ExecutionErrorKind::Cancelled,
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::PermissionDenied
            | ErrorCode::SystemIoFailure => ExecutionErrorKind::ConnectionFailure,
            _ if phase == Phase::Open => ExecutionErrorKind::ConnectionFailure,
            _ if phase == Phase::Prepare => ExecutionErrorKind::SyntaxRejectedByEngine,
            _ => ExecutionErrorKind::Unknown,
        },
        _ if phase == Phase::Open => ExecutionErrorKind::ConnectionFailure,
        _ if phase == Phase::Prepare => ExecutionErrorKind::SyntaxRejectedByEngine,
        _ => ExecutionErrorKind::Unknown,
    };
    ExecutionError::new(kind, err.to_string())
}
