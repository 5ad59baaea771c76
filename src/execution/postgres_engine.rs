//! PostgreSQL Execution Engine
//!
//! sqlx pool; every query runs inside a read-only transaction with a local
//! `statement_timeout`, so the server cancels runaway statements itself.

use super::engine::{ExecutionEngine, ExecutionError, ExecutionErrorKind, FetchRequest, FetchedRows};
use super::result::{ColumnMeta, Value};
use crate::schema::{ColumnSchema, SchemaError, SchemaProvider, SchemaSnapshot, TableSchema};
use crate::sql::dialect::top_to_limit;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::types::PgMoney;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Row, Statement, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::{debug, info};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PostgresEngine {
    pool: PgPool,
}

impl PostgresEngine {
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self, ExecutionError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size.max(1) as u32)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await
            .map_err(map_error)?;
        info!(pool_size, "PostgreSQL engine ready");
        Ok(Self { pool })
    }

    async fn run(&self, request: &FetchRequest) -> Result<FetchedRows, ExecutionError> {
        let sql = top_to_limit(&request.sql);
        let mut tx = self.pool.begin().await.map_err(map_error)?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(map_error)?;
        // SET does not take bind parameters
        let timeout_ms = request.timeout.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout_ms))
            .execute(&mut *tx)
            .await
            .map_err(map_error)?;

        let statement = (&mut *tx).prepare(sql.as_str()).await.map_err(map_error)?;
        let columns: Vec<ColumnMeta> = statement
            .columns()
            .iter()
            .map(|c| ColumnMeta::new(c.name(), Some(c.type_info().name())))
            .collect();

        // Stop reading at the ceiling; the rollback discards whatever the server still sends
        let mut rows = Vec::new();
        {
            let mut stream = statement.query().fetch(&mut *tx);
            while rows.len() < request.max_rows {
                match stream.try_next().await.map_err(map_error)? {
                    Some(row) => rows.push((0..columns.len()).map(|i| decode_cell(&row, i)).collect()),
                    None => break,
                }
            }
        }

        tx.rollback().await.map_err(map_error)?;
        Ok(FetchedRows { columns, rows })
    }
}

#[async_trait]
impl ExecutionEngine for PostgresEngine {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn fetch(&self, request: FetchRequest) -> Result<FetchedRows, ExecutionError> {
        debug!(timeout_ms = request.timeout.as_millis() as u64, "Running PostgreSQL query");
        // Client-side backstop in case the server never answers
        let backstop = request.timeout + Duration::from_secs(1);
        match tokio::time::timeout(backstop, self.run(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::timeout(request.timeout)),
        }
    }

    async fn health_check(&self) -> Result<String, ExecutionError> {
        sqlx::query_scalar::<_, String>("SELECT version()")
            .fetch_one(&self.pool)
            .await
            .map_err(map_error)
    }
}

#[async_trait]
impl SchemaProvider for PostgresEngine {
    async fn load_schema(&self) -> Result<SchemaSnapshot, SchemaError> {
        let unavailable = |e: sqlx::Error| SchemaError::Unavailable(map_error(e).message);

        let tables: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_schema::text, table_name::text \
             FROM information_schema.tables \
             WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
               AND table_type IN ('BASE TABLE', 'VIEW') \
             ORDER BY table_schema, table_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let columns: Vec<(String, String, String, String, bool)> = sqlx::query_as(
            "SELECT table_schema::text, table_name::text, column_name::text, data_type::text, \
                    (is_nullable = 'YES') AS nullable \
             FROM information_schema.columns \
             WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY table_schema, table_name, ordinal_position",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let snapshot = tables
            .into_iter()
            .map(|(schema, name)| {
                let table_columns = columns
                    .iter()
                    .filter(|(s, t, _, _, _)| *s == schema && *t == name)
                    .map(|(_, _, column, data_type, nullable)| ColumnSchema {
                        name: column.clone(),
                        data_type: data_type.clone(),
                        nullable: *nullable,
                    })
                    .collect();
                TableSchema {
                    schema: Some(schema),
                    name,
                    columns: table_columns,
                }
            })
            .collect();
        Ok(SchemaSnapshot::new(snapshot))
    }
}

/// Decode by the column's wire type. Types without a decoder in the enabled
/// sqlx features (JSON, arrays, ranges) come back as a labelled placeholder.
fn decode_cell(row: &PgRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return Value::Null,
    };

    let decoded = match type_name.as_str() {
        "BOOL" => row.try_get::<bool, _>(index).map(Value::Bool),
        "INT2" => row.try_get::<i16, _>(index).map(|v| Value::Int(v.into())),
        "INT4" => row.try_get::<i32, _>(index).map(|v| Value::Int(v.into())),
        "INT8" => row.try_get::<i64, _>(index).map(Value::Int),
        "FLOAT4" => row.try_get::<f32, _>(index).map(|v| Value::Float(v.into())),
        "FLOAT8" => row.try_get::<f64, _>(index).map(Value::Float),
        "NUMERIC" => row.try_get::<Decimal, _>(index).map(decimal_value),
        "MONEY" => row.try_get::<PgMoney, _>(index).map(|money| money_value(money.0)),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => row.try_get::<String, _>(index).map(Value::Text),
        "BYTEA" => row.try_get::<Vec<u8>, _>(index).map(Value::Bytes),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(index)
            .map(|v| Value::Text(v.to_string())),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(index)
            .map(|v| Value::Text(v.to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(index)
            .map(|v| Value::Text(v.to_rfc3339())),
        "TIME" => row
            .try_get::<chrono::NaiveTime, _>(index)
            .map(|v| Value::Text(v.to_string())),
        "UUID" => row.try_get::<uuid::Uuid, _>(index).map(|v| Value::Text(v.to_string())),
        other => return Value::Text(format!("<unsupported {}>", other)),
    };

    decoded.unwrap_or_else(|e| Value::Text(format!("<undecodable {}: {}>", type_name, e)))
}

/// Whole decimals (`SUM` over integers) stay integers; the rest become floats.
fn decimal_value(value: Decimal) -> Value {
    if value.fract().is_zero() {
        if let Some(int) = value.to_i64() {
            return Value::Int(int);
        }
    }
    value
        .to_f64()
        .map(Value::Float)
        .unwrap_or_else(|| Value::Text(value.to_string()))
}

/// MONEY travels as an integer count of cents.
fn money_value(cents: i64) -> Value {
    decimal_value(Decimal::new(cents, 2))
}

fn map_error(err: sqlx::Error) -> ExecutionError {
    let kind = match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            match code.as_str() {
                "57014" => ExecutionErrorKind::Timeout,
                "25006" => ExecutionErrorKind::SyntaxRejectedByEngine,
                c if c.starts_with("42") => ExecutionErrorKind::SyntaxRejectedByEngine,
                c if c.starts_with("08") || c.starts_with("28") || c.starts_with("57P") => {
                    ExecutionErrorKind::ConnectionFailure
                }
                _ => ExecutionErrorKind::Unknown,
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Configuration(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ExecutionErrorKind::ConnectionFailure,
        _ => ExecutionErrorKind::Unknown,
    };
    ExecutionError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_numeric_aggregates_decode_to_numbers() {
        // AVG(price)
        assert_eq!(decimal_value(Decimal::from_str("12.3750").unwrap()), Value::Float(12.375));
        // SUM(quantity) over BIGINT
        assert_eq!(decimal_value(Decimal::from(42)), Value::Int(42));
        assert_eq!(decimal_value(Decimal::from_str("7.000").unwrap()), Value::Int(7));
        assert_eq!(decimal_value(Decimal::from_str("-0.5").unwrap()), Value::Float(-0.5));
    }

    #[test]
    fn test_money_is_scaled_from_cents() {
        assert_eq!(money_value(1250), Value::Float(12.5));
        assert_eq!(money_value(-300), Value::Int(-3));
    }
}
