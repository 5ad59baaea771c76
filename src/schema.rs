//! Schema Provider
//!
//! Table and column metadata read from the target database. The snapshot
//! grounds SQL generation and backs the validator's table check.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Owning schema (`dbo`, `public`); `None` for engines without schemas
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn column(mut self, name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        self.columns.push(ColumnSchema {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
        });
        self
    }

    /// `schema.name` when a schema is known, otherwise just the name
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }

    /// Whether a (possibly qualified) reference names this table.
    ///
    /// Names compare case-insensitively. A two-part reference must agree with
    /// the table's schema (`main` stands in for engines without one); three or
    /// more parts point at another database and never match.
    pub fn matches_reference(&self, parts: &[String]) -> bool {
        match parts {
            [name] => name.eq_ignore_ascii_case(&self.name),
            [schema, name] => {
                if !name.eq_ignore_ascii_case(&self.name) {
                    return false;
                }
                match &self.schema {
                    Some(own) => schema.eq_ignore_ascii_case(own),
                    None => schema.eq_ignore_ascii_case("main"),
                }
            }
            _ => false,
        }
    }
}

/// Ordered list of tables as read from the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableSchema>,
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self { tables }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn find_table(&self, parts: &[String]) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.matches_reference(parts))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.qualified_name()).collect()
    }

    /// Grounding text for the SQL generation prompt.
    pub fn render_for_prompt(&self, max_tables: usize) -> String {
        let mut text = String::from("Database Schema:\n\n");

        for table in self.tables.iter().take(max_tables) {
            let _ = writeln!(text, "Table: {}", table.qualified_name());
            text.push_str("Columns:\n");
            for column in &table.columns {
                let nullable = if column.nullable { "NULL" } else { "NOT NULL" };
                let _ = writeln!(text, "  - {} ({}, {})", column.name, column.data_type, nullable);
            }
            text.push('\n');
        }

        if self.tables.len() > max_tables {
            let _ = writeln!(text, "\n... and {} more tables", self.tables.len() - max_tables);
        }

        text
    }
}

/// Reads the live catalog.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn load_schema(&self) -> Result<SchemaSnapshot, SchemaError>;
}

/// Fixed snapshot, for tests and for callers that manage metadata themselves.
pub struct StaticSchemaProvider {
    snapshot: SchemaSnapshot,
}

impl StaticSchemaProvider {
    pub fn new(snapshot: SchemaSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn load_schema(&self) -> Result<SchemaSnapshot, SchemaError> {
        Ok(self.snapshot.clone())
    }
}

/// Read-mostly cache in front of a [`SchemaProvider`].
///
/// Readers clone an `Arc` under a short read lock, so they see either the old
/// or the new snapshot in full. Loads are serialised through `refresh_lock`,
/// which makes at most one catalog query run at a time.
pub struct CachedSchemaProvider {
    source: Arc<dyn SchemaProvider>,
    current: RwLock<Option<Arc<SchemaSnapshot>>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl CachedSchemaProvider {
    pub fn new(source: Arc<dyn SchemaProvider>) -> Self {
        Self {
            source,
            current: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Cached snapshot, warming the cache on first use.
    pub async fn snapshot(&self) -> Result<Arc<SchemaSnapshot>, SchemaError> {
        if let Some(snapshot) = self.cached() {
            return Ok(snapshot);
        }

        let _writer = self.refresh_lock.lock().await;
        // Another task may have warmed the cache while we waited
        if let Some(snapshot) = self.cached() {
            return Ok(snapshot);
        }
        self.reload().await
    }

    /// Re-read the catalog and swap the snapshot in.
    pub async fn refresh(&self) -> Result<Arc<SchemaSnapshot>, SchemaError> {
        let _writer = self.refresh_lock.lock().await;
        self.reload().await
    }

    pub fn cached(&self) -> Option<Arc<SchemaSnapshot>> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }

    async fn reload(&self) -> Result<Arc<SchemaSnapshot>, SchemaError> {
        debug!("Loading schema snapshot from catalog");
        let snapshot = Arc::new(self.source.load_schema().await?);
        {
            let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = Some(Arc::clone(&snapshot));
        }
        info!(tables = snapshot.tables.len(), "Schema snapshot loaded");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new(vec![
            TableSchema::new("Products")
                .in_schema("dbo")
                .column("Product_Name", "nvarchar", false)
                .column("Price", "money", true),
            TableSchema::new("Orders").in_schema("dbo").column("Order_ID", "int", false),
        ])
    }

    #[test]
    fn test_reference_matching() {
        let snapshot = sample_snapshot();
        let parts = |s: &[&str]| s.iter().map(|p| p.to_string()).collect::<Vec<_>>();

        assert!(snapshot.find_table(&parts(&["products"])).is_some());
        assert!(snapshot.find_table(&parts(&["DBO", "Products"])).is_some());
        assert!(snapshot.find_table(&parts(&["sales", "Products"])).is_none());
        assert!(snapshot.find_table(&parts(&["otherdb", "dbo", "Products"])).is_none());
        assert!(snapshot.find_table(&parts(&["Customers"])).is_none());
    }

    #[test]
    fn test_render_for_prompt_truncates() {
        let text = sample_snapshot().render_for_prompt(1);
        assert!(text.starts_with("Database Schema:"));
        assert!(text.contains("Table: dbo.Products"));
        assert!(text.contains("  - Product_Name (nvarchar, NOT NULL)"));
        assert!(text.contains("  - Price (money, NULL)"));
        assert!(!text.contains("Table: dbo.Orders"));
        assert!(text.contains("... and 1 more tables"));
    }

    struct CountingProvider {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl SchemaProvider for CountingProvider {
        async fn load_schema(&self) -> Result<SchemaSnapshot, SchemaError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(sample_snapshot())
        }
    }

    #[tokio::test]
    async fn test_cache_loads_once_until_refresh() {
        let source = Arc::new(CountingProvider { loads: AtomicUsize::new(0) });
        let cache = Arc::new(CachedSchemaProvider::new(source.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.snapshot().await.map(|s| s.tables.len()) }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 2);
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        cache.refresh().await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }
}
