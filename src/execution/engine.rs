//! Execution Engine Trait - Core contract for database engines
//!
//! One query-and-fetch operation parameterised by SQL text, timeout and a row
//! ceiling. Engines own their connection pools and must hand the connection
//! back on every exit path.

use super::result::{ColumnMeta, Value};
use crate::error::redact_credentials;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionErrorKind {
    Timeout,
    ConnectionFailure,
    SyntaxRejectedByEngine,
    Cancelled,
    Unknown,
}

impl ExecutionErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionErrorKind::Timeout => "Timeout",
            ExecutionErrorKind::ConnectionFailure => "ConnectionFailure",
            ExecutionErrorKind::SyntaxRejectedByEngine => "SyntaxRejectedByEngine",
            ExecutionErrorKind::Cancelled => "Cancelled",
            ExecutionErrorKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Typed execution failure. The message keeps the driver's diagnostics with
/// credentials masked.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl AsRef<str>) -> Self {
        Self {
            kind,
            message: redact_credentials(message.as_ref()),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ExecutionErrorKind::Timeout,
            format!("query did not finish within {} ms", limit.as_millis()),
        )
    }

    pub fn connection(message: impl AsRef<str>) -> Self {
        Self::new(ExecutionErrorKind::ConnectionFailure, message)
    }

    pub fn unknown(message: impl AsRef<str>) -> Self {
        Self::new(ExecutionErrorKind::Unknown, message)
    }
}

/// One query-and-fetch call
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub sql: String,
    /// Engine-side limit; the engine aborts the statement when it passes
    pub timeout: Duration,
    /// Stop reading after this many rows
    pub max_rows: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FetchedRows {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
}

/// Execution engine trait - implemented by every supported database
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Engine name (e.g., "sqlite", "postgres")
    fn name(&self) -> &'static str;

    /// Run a read-only query and return at most `max_rows` rows
    async fn fetch(&self, request: FetchRequest) -> Result<FetchedRows, ExecutionError>;

    /// Round-trip to the database, returning its version string
    async fn health_check(&self) -> Result<String, ExecutionError>;
}
