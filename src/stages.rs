//! Deterministic Stages
//!
//! The non-generative steps of the question pipeline: schema grounding, the
//! validate-then-execute gate, and result formatting for the insight stages.

use crate::chart::{infer_column_kinds, recommend_chart, ColumnKind};
use crate::execution::{QueryExecutor, QueryResult};
use crate::pipeline::{
    keys, PipelineStage, RunContext, StageDescriptor, StageError, StageOutputs, StateView,
};
use crate::schema::CachedSchemaProvider;
use crate::sql::SqlSafetyValidator;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Writes the schema grounding text.
pub struct SchemaContextStage {
    descriptor: StageDescriptor,
    schema: Arc<CachedSchemaProvider>,
    max_tables: usize,
}

impl SchemaContextStage {
    pub fn new(schema: Arc<CachedSchemaProvider>, max_tables: usize) -> Self {
        Self {
            descriptor: StageDescriptor::leaf("schema_context", [], [keys::SCHEMA_CONTEXT]),
            schema,
            max_tables,
        }
    }
}

#[async_trait]
impl PipelineStage for SchemaContextStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn run(&self, _view: StateView<'_>, ctx: &RunContext) -> Result<StageOutputs, StageError> {
        let snapshot = self.schema.snapshot().await?;
        debug!(run_id = %ctx.run_id, tables = snapshot.tables.len(), "Schema context loaded");
        Ok(StageOutputs::new().with(keys::SCHEMA_CONTEXT, snapshot.render_for_prompt(self.max_tables)))
    }
}

/// Validates the drafted SQL and, only if it passes, executes it.
pub struct SqlExecutorStage {
    descriptor: StageDescriptor,
    schema: Arc<CachedSchemaProvider>,
    executor: Arc<QueryExecutor>,
}

impl SqlExecutorStage {
    pub fn new(schema: Arc<CachedSchemaProvider>, executor: Arc<QueryExecutor>) -> Self {
        Self {
            descriptor: StageDescriptor::leaf(
                "sql_executor",
                [keys::SQL_QUERY],
                [keys::VALIDATED_SQL, keys::QUERY_RESULTS],
            ),
            schema,
            executor,
        }
    }
}

#[async_trait]
impl PipelineStage for SqlExecutorStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn run(&self, view: StateView<'_>, ctx: &RunContext) -> Result<StageOutputs, StageError> {
        let candidate = view.text(&keys::SQL_QUERY)?;
        let snapshot = self.schema.snapshot().await?;
        let validator = SqlSafetyValidator::new(snapshot, self.executor.policy().max_rows);

        let query = validator.validate(candidate).map_err(|reason| {
            warn!(run_id = %ctx.run_id, code = reason.code(), reason = %reason, "SQL rejected");
            reason
        })?;
        info!(run_id = %ctx.run_id, row_cap = query.row_cap(), "SQL accepted");

        let result = self.executor.execute(&query).await?;
        Ok(StageOutputs::new()
            .with(keys::VALIDATED_SQL, query.sql())
            .with(keys::QUERY_RESULTS, result))
    }
}

/// Summarises the result for the insight stages and attaches a chart hint.
/// The table itself is left untouched.
pub struct DataFormatterStage {
    descriptor: StageDescriptor,
    sample_rows: usize,
}

impl DataFormatterStage {
    pub fn new(sample_rows: usize) -> Self {
        Self {
            descriptor: StageDescriptor::leaf(
                "data_formatter",
                [keys::VALIDATED_SQL, keys::QUERY_RESULTS],
                [keys::FORMATTED_DATA, keys::CHART_HINT],
            ),
            sample_rows,
        }
    }
}

#[async_trait]
impl PipelineStage for DataFormatterStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn run(&self, view: StateView<'_>, _ctx: &RunContext) -> Result<StageOutputs, StageError> {
        let sql = view.text(&keys::VALIDATED_SQL)?;
        let result = view.table(&keys::QUERY_RESULTS)?;
        let hint = recommend_chart(result);

        Ok(StageOutputs::new()
            .with(keys::FORMATTED_DATA, format_data(sql, result, self.sample_rows))
            .with(keys::CHART_HINT, hint.describe()))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ColumnStats {
    count: usize,
    mean: f64,
    std: f64,
    min: f64,
    max: f64,
}

fn column_stats(result: &QueryResult, index: usize) -> Option<ColumnStats> {
    let values: Vec<f64> = result.column_values(index).filter_map(|v| v.as_f64()).collect();
    if values.is_empty() {
        return None;
    }
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let std = if count > 1 {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64).sqrt()
    } else {
        0.0
    };
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(ColumnStats {
        count,
        mean,
        std,
        min,
        max,
    })
}

/// Digest of a result: row count, SQL, columns with inferred kinds, the
/// first `sample_rows` rows as JSON, and statistics for numeric columns.
pub fn format_data(sql: &str, result: &QueryResult, sample_rows: usize) -> String {
    if result.is_empty() {
        return format!(
            "No data available\n\nSQL Query: {}\n\nColumns: {}",
            sql,
            result.column_names().join(", ")
        );
    }

    let kinds = infer_column_kinds(result);
    let mut out = String::from("Here are the query results:\n");
    let _ = writeln!(out, "\nSQL Query: {}", sql);
    let _ = write!(out, "\nResults: {} rows returned", result.row_count());
    if result.truncated() {
        let _ = write!(out, " (truncated at the row cap; more rows exist)");
    }
    let _ = writeln!(out, "\n\nColumns: {}", result.column_names().join(", "));

    let types: Vec<String> = result
        .columns()
        .iter()
        .zip(&kinds)
        .map(|(column, kind)| format!("{}: {}", column.name, kind))
        .collect();
    let _ = writeln!(out, "Column Kinds: {}", types.join(", "));

    let sample = result.to_json_records(sample_rows);
    let shown = result.row_count().min(sample_rows);
    let _ = writeln!(
        out,
        "\nSample Data (first {} rows):\n{}",
        shown,
        serde_json::to_string_pretty(&sample).unwrap_or_default()
    );

    let numeric: Vec<(usize, ColumnStats)> = kinds
        .iter()
        .enumerate()
        .filter(|(_, kind)| **kind == ColumnKind::Quantitative)
        .filter_map(|(i, _)| column_stats(result, i).map(|s| (i, s)))
        .collect();
    if !numeric.is_empty() {
        let _ = writeln!(out, "\nSummary Statistics:");
        for (index, stats) in numeric {
            let _ = writeln!(
                out,
                "  {}: count={} mean={:.2} std={:.2} min={} max={}",
                result.columns()[index].name,
                stats.count,
                stats.mean,
                stats.std,
                stats.min,
                stats.max
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ColumnMeta, Value};
    use crate::pipeline::StageState;

    fn products() -> QueryResult {
        QueryResult::new(
            vec![ColumnMeta::new("Product_Name", Some("TEXT")), ColumnMeta::new("Price", Some("REAL"))],
            vec![
                vec![Value::Text("Bike".to_string()), Value::Float(2499.0)],
                vec![Value::Text("Helmet".to_string()), Value::Float(1200.0)],
                vec![Value::Text("Bottle".to_string()), Value::Float(15.5)],
            ],
            3,
            true,
        )
    }

    #[test]
    fn test_format_data_digest() {
        let text = format_data("SELECT TOP 3 Product_Name, Price FROM Products", &products(), 2);
        assert!(text.contains("Results: 3 rows returned (truncated"));
        assert!(text.contains("Columns: Product_Name, Price"));
        assert!(text.contains("Product_Name: nominal, Price: quantitative"));
        assert!(text.contains("Sample Data (first 2 rows)"));
        assert!(text.contains("\"Helmet\""));
        assert!(!text.contains("\"Bottle\""));
        assert!(text.contains("Price: count=3"));
        assert!(text.contains("max=2499"));
    }

    #[test]
    fn test_format_empty_result() {
        let empty = QueryResult::new(vec![ColumnMeta::new("n", None)], Vec::new(), 0, false);
        assert!(format_data("SELECT TOP 1 n FROM t", &empty, 10).starts_with("No data available"));
    }

    #[tokio::test]
    async fn test_data_formatter_stage_outputs() {
        let mut state = StageState::new();
        state.insert("sql_executor", keys::VALIDATED_SQL, "SELECT TOP 3 * FROM Products").unwrap();
        state.insert("sql_executor", keys::QUERY_RESULTS, products()).unwrap();

        let stage = DataFormatterStage::new(10);
        let declared = stage.descriptor().inputs.clone();
        let outputs = stage
            .run(state.view("data_formatter", &declared), &RunContext::new())
            .await
            .unwrap()
            .into_entries();

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].0, keys::FORMATTED_DATA);
        assert_eq!(outputs[1].0, keys::CHART_HINT);
        match &outputs[1].1 {
            crate::pipeline::StateValue::Text(hint) => assert!(hint.starts_with("Recommended chart: arc")),
            other => panic!("unexpected hint value: {:?}", other),
        }
    }
}
