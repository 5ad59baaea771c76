//! Query Result - Immutable tabular result handed to later stages

use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed scalar cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(format!("<{} bytes>", b.len())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    /// Type as declared by the engine, when it reports one
    pub declared_type: Option<String>,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, declared_type: Option<&str>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.map(str::to_string),
        }
    }
}

/// Rectangular result with execution metadata. Fields are private; once built
/// a result never changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    columns: Vec<ColumnMeta>,
    rows: Vec<Vec<Value>>,
    row_count: usize,
    elapsed_ms: u64,
    /// The full result set had more rows than the cap
    truncated: bool,
}

impl QueryResult {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Vec<Value>>, elapsed_ms: u64, truncated: bool) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            elapsed_ms,
            truncated,
        }
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Cells of one column, top to bottom
    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &Value> {
        self.rows.iter().filter_map(move |row| row.get(index))
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First `limit` rows as JSON objects keyed by column name
    pub fn to_json_records(&self, limit: usize) -> serde_json::Value {
        let records = self
            .rows
            .iter()
            .take(limit)
            .map(|row| {
                let object = self
                    .columns
                    .iter()
                    .zip(row.iter())
                    .map(|(column, value)| (column.name.clone(), value.to_json()))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(object)
            })
            .collect();
        serde_json::Value::Array(records)
    }

    /// Plain-text table for terminals, showing at most `max_rows` rows.
    pub fn render_table(&self, max_rows: usize) -> String {
        if self.columns.is_empty() {
            return "(no columns)\n".to_string();
        }

        let shown: Vec<Vec<String>> = self
            .rows
            .iter()
            .take(max_rows)
            .map(|row| row.iter().map(|v| v.to_string()).collect())
            .collect();

        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.name.chars().count()).collect();
        for row in &shown {
            for (i, cell) in row.iter().enumerate() {
                if let Some(width) = widths.get_mut(i) {
                    *width = (*width).max(cell.chars().count());
                }
            }
        }

        let line = |cells: Vec<&str>| -> String {
            let padded: Vec<String> = cells
                .iter()
                .zip(widths.iter())
                .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
                .collect();
            format!("| {} |\n", padded.join(" | "))
        };
        let separator = format!(
            "|{}|\n",
            widths.iter().map(|w| "-".repeat(w + 2)).collect::<Vec<_>>().join("|")
        );

        let mut out = line(self.columns.iter().map(|c| c.name.as_str()).collect());
        out.push_str(&separator);
        for row in &shown {
            out.push_str(&line(row.iter().map(|s| s.as_str()).collect()));
        }

        let hidden = self.row_count.saturating_sub(shown.len());
        if hidden > 0 {
            out.push_str(&format!("... {} more rows\n", hidden));
        }
        out.push_str(&format!(
            "({} rows{}, {} ms)\n",
            self.row_count,
            if self.truncated { ", truncated at the row cap" } else { "" },
            self.elapsed_ms
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> QueryResult {
        QueryResult::new(
            vec![ColumnMeta::new("Product_Name", Some("TEXT")), ColumnMeta::new("Price", Some("REAL"))],
            vec![
                vec![Value::Text("Widget".into()), Value::Float(9.5)],
                vec![Value::Text("Gadget".into()), Value::Null],
            ],
            3,
            false,
        )
    }

    #[test]
    fn test_json_records() {
        let json = sample().to_json_records(1);
        assert_eq!(json, serde_json::json!([{"Product_Name": "Widget", "Price": 9.5}]));
    }

    #[test]
    fn test_render_table() {
        let text = sample().render_table(1);
        assert!(text.starts_with("| Product_Name | Price |"));
        assert!(text.contains("| Widget       | 9.5   |"));
        assert!(text.contains("... 1 more rows"));
        assert!(text.contains("(2 rows, 3 ms)"));
    }

    #[test]
    fn test_untagged_serialization() {
        let encoded = serde_json::to_string(&vec![Value::Null, Value::Int(3), Value::Text("x".into())]).unwrap();
        assert_eq!(encoded, r#"[null,3,"x"]"#);
    }
}
