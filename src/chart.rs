//! Chart Specifications
//!
//! A small Vega-Lite-like chart spec, column kind inference over a
//! [`QueryResult`], and the deterministic chart recommendation the
//! visualization stage is grounded with.

use crate::execution::{QueryResult, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Categorical charts with fewer categories than this may use an arc
const ARC_MAX_CATEGORIES: usize = 7;
/// More categories than this flips bars horizontal
const HORIZONTAL_MIN_CATEGORIES: usize = 10;
/// Labels longer than this flip bars horizontal
const LONG_LABEL_CHARS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mark {
    Bar,
    Line,
    Arc,
    Text,
    Point,
    Area,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Quantitative,
    Temporal,
    Nominal,
    Ordinal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDef {
    pub field: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldDef {
    pub fn new(field: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            field: field.into(),
            field_type,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Encoding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<FieldDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<FieldDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<FieldDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theta: Option<FieldDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<FieldDef>,
}

impl Encoding {
    pub fn channels(&self) -> impl Iterator<Item = (&'static str, &FieldDef)> {
        [
            ("x", &self.x),
            ("y", &self.y),
            ("color", &self.color),
            ("theta", &self.theta),
            ("text", &self.text),
        ]
        .into_iter()
        .filter_map(|(name, def)| def.as_ref().map(|d| (name, d)))
    }
}

/// Wide-to-long reshape: the listed columns become `as.0` (name) / `as.1` (value) pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FoldTransform {
    pub fold: Vec<String>,
    #[serde(rename = "as", default = "default_fold_names")]
    pub as_names: (String, String),
}

fn default_fold_names() -> (String, String) {
    ("key".to_string(), "value".to_string())
}

/// The only chart shape the visualization stage may produce. Keys outside
/// it (inline `data`, `$schema`, extra channels) are rejected, not ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChartSpec {
    pub mark: Mark,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transform: Vec<FoldTransform>,
    pub encoding: Encoding,
}

impl ChartSpec {
    /// Check every encoded field against the result's columns (or a fold's
    /// output names) and every folded column against the result.
    pub fn check_fields(&self, result: &QueryResult) -> Result<(), String> {
        let columns: HashSet<&str> = result.columns().iter().map(|c| c.name.as_str()).collect();
        let mut known = columns.clone();

        for transform in &self.transform {
            if let Some(missing) = transform.fold.iter().find(|c| !columns.contains(c.as_str())) {
                return Err(format!("fold references unknown column '{}'", missing));
            }
            known.insert(transform.as_names.0.as_str());
            known.insert(transform.as_names.1.as_str());
        }

        let mut encoded = 0;
        for (channel, def) in self.encoding.channels() {
            if !known.contains(def.field.as_str()) {
                return Err(format!("{} encodes unknown field '{}'", channel, def.field));
            }
            encoded += 1;
        }
        if encoded == 0 {
            return Err("chart spec encodes no fields".to_string());
        }
        Ok(())
    }
}

/// Inferred kind of a result column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Quantitative,
    Temporal,
    Nominal,
}

impl ColumnKind {
    pub fn field_type(self) -> FieldType {
        match self {
            ColumnKind::Quantitative => FieldType::Quantitative,
            ColumnKind::Temporal => FieldType::Temporal,
            ColumnKind::Nominal => FieldType::Nominal,
        }
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnKind::Quantitative => "quantitative",
            ColumnKind::Temporal => "temporal",
            ColumnKind::Nominal => "nominal",
        };
        f.write_str(name)
    }
}

fn is_temporal_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    ["Date", "Year", "Month", "Week", "Quarter", "Day"].iter().any(|part| {
        let part_lower = part.to_lowercase();
        lower == part_lower || lower.ends_with(&format!("_{}", part_lower)) || name.ends_with(part)
    })
}

fn looks_like_date(text: &str) -> bool {
    let text = text.trim();
    chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
        || chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").is_ok()
        || chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S").is_ok()
        || chrono::DateTime::parse_from_rfc3339(text).is_ok()
}

fn declared_numeric(declared: &str) -> bool {
    let lower = declared.to_lowercase();
    ["int", "real", "float", "double", "numeric", "decimal", "money"]
        .iter()
        .any(|t| lower.contains(t))
}

/// Infer the kind of column `index` from its declared type, name and values.
pub fn infer_column_kind(result: &QueryResult, index: usize) -> ColumnKind {
    let Some(column) = result.columns().get(index) else {
        return ColumnKind::Nominal;
    };
    let declared = column.declared_type.as_deref().unwrap_or("");
    if declared.to_lowercase().contains("date") || declared.to_lowercase().contains("time") {
        return ColumnKind::Temporal;
    }

    let values: Vec<&Value> = result.column_values(index).filter(|v| !v.is_null()).collect();
    if values.is_empty() {
        return if declared_numeric(declared) {
            ColumnKind::Quantitative
        } else {
            ColumnKind::Nominal
        };
    }

    let numeric = values
        .iter()
        .all(|v| v.as_f64().is_some() || v.as_str().map(|s| s.trim().parse::<f64>().is_ok()).unwrap_or(false));
    if numeric {
        let integral = values.iter().all(|v| matches!(v, Value::Int(_)));
        if integral && is_temporal_name(&column.name) {
            return ColumnKind::Temporal;
        }
        return ColumnKind::Quantitative;
    }

    if values.iter().all(|v| v.as_str().map(looks_like_date).unwrap_or(false)) {
        return ColumnKind::Temporal;
    }
    ColumnKind::Nominal
}

pub fn infer_column_kinds(result: &QueryResult) -> Vec<ColumnKind> {
    (0..result.columns().len())
        .map(|i| infer_column_kind(result, i))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    TextTable,
    MeltedBar,
    Line,
    Arc,
    HorizontalBar,
    Bar,
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChartKind::TextTable => "text table",
            ChartKind::MeltedBar => "melted bar",
            ChartKind::Line => "line",
            ChartKind::Arc => "arc",
            ChartKind::HorizontalBar => "horizontal bar",
            ChartKind::Bar => "bar",
        };
        f.write_str(name)
    }
}

/// A deterministic chart recommendation plus a ready-made spec for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartHint {
    pub kind: ChartKind,
    pub reason: String,
    pub spec: ChartSpec,
}

impl ChartHint {
    /// Text handed to the visualization prompt
    pub fn describe(&self) -> String {
        let spec = serde_json::to_string(&self.spec).unwrap_or_default();
        format!(
            "Recommended chart: {} ({})\nSuggested spec: {}",
            self.kind, self.reason, spec
        )
    }
}

fn field(result: &QueryResult, index: usize, field_type: FieldType) -> FieldDef {
    FieldDef::new(result.columns()[index].name.clone(), field_type)
}

/// Pick a chart for a result table.
///
/// Priority: text-only data gets a text table; a single row of metrics is
/// folded into a labelled bar; a temporal column gets a line; categories get
/// an arc when few and non-negative, a horizontal bar when many or long, and
/// a vertical bar otherwise.
pub fn recommend_chart(result: &QueryResult) -> ChartHint {
    let kinds = infer_column_kinds(result);
    let numeric: Vec<usize> = kinds
        .iter()
        .enumerate()
        .filter(|(_, k)| **k == ColumnKind::Quantitative)
        .map(|(i, _)| i)
        .collect();
    let temporal = kinds.iter().position(|k| *k == ColumnKind::Temporal);
    let nominal = kinds.iter().position(|k| *k == ColumnKind::Nominal);

    let text_table = |reason: &str| ChartHint {
        kind: ChartKind::TextTable,
        reason: reason.to_string(),
        spec: ChartSpec {
            mark: Mark::Text,
            title: None,
            transform: Vec::new(),
            encoding: Encoding {
                y: result.columns().first().map(|_| field(result, 0, FieldType::Nominal)),
                text: result.columns().first().map(|_| field(result, 0, FieldType::Nominal)),
                ..Encoding::default()
            },
        },
    };

    if result.is_empty() {
        return text_table("no rows to plot");
    }
    let Some(&value) = numeric.first() else {
        return text_table("no numeric columns");
    };

    if result.row_count() == 1 {
        let folded: Vec<String> = numeric.iter().map(|&i| result.columns()[i].name.clone()).collect();
        return ChartHint {
            kind: ChartKind::MeltedBar,
            reason: format!("single row with {} metric(s)", folded.len()),
            spec: ChartSpec {
                mark: Mark::Bar,
                title: Some("Key Metrics".to_string()),
                transform: vec![FoldTransform {
                    fold: folded,
                    as_names: ("Metric".to_string(), "Value".to_string()),
                }],
                encoding: Encoding {
                    x: Some(FieldDef::new("Value", FieldType::Quantitative)),
                    y: Some(FieldDef::new("Metric", FieldType::Nominal)),
                    text: Some(FieldDef::new("Value", FieldType::Quantitative)),
                    ..Encoding::default()
                },
            },
        };
    }

    if let Some(time) = temporal {
        return ChartHint {
            kind: ChartKind::Line,
            reason: format!("'{}' is a time axis", result.columns()[time].name),
            spec: ChartSpec {
                mark: Mark::Line,
                title: None,
                transform: Vec::new(),
                encoding: Encoding {
                    x: Some(field(result, time, FieldType::Temporal)),
                    y: Some(field(result, value, FieldType::Quantitative)),
                    ..Encoding::default()
                },
            },
        };
    }

    let Some(category) = nominal else {
        if numeric.len() >= 2 {
            return ChartHint {
                kind: ChartKind::Bar,
                reason: "numeric columns only".to_string(),
                spec: ChartSpec {
                    mark: Mark::Bar,
                    title: None,
                    transform: Vec::new(),
                    encoding: Encoding {
                        x: Some(field(result, numeric[0], FieldType::Ordinal)),
                        y: Some(field(result, numeric[1], FieldType::Quantitative)),
                        ..Encoding::default()
                    },
                },
            };
        }
        return text_table("a single numeric column with no category");
    };

    let labels: HashSet<String> = result.column_values(category).map(|v| v.to_string()).collect();
    let longest = labels.iter().map(|l| l.chars().count()).max().unwrap_or(0);
    let non_negative = result
        .column_values(value)
        .all(|v| v.as_f64().map(|f| f >= 0.0).unwrap_or(true));

    let (kind, reason, encoding) = if labels.len() > HORIZONTAL_MIN_CATEGORIES || longest > LONG_LABEL_CHARS {
        (
            ChartKind::HorizontalBar,
            format!("{} categories, longest label {} chars", labels.len(), longest),
            Encoding {
                x: Some(field(result, value, FieldType::Quantitative)),
                y: Some(field(result, category, FieldType::Nominal)),
                ..Encoding::default()
            },
        )
    } else if labels.len() < ARC_MAX_CATEGORIES && numeric.len() == 1 && non_negative {
        (
            ChartKind::Arc,
            format!("part-to-whole across {} categories", labels.len()),
            Encoding {
                theta: Some(field(result, value, FieldType::Quantitative)),
                color: Some(field(result, category, FieldType::Nominal)),
                ..Encoding::default()
            },
        )
    } else {
        (
            ChartKind::Bar,
            format!("comparison across {} categories", labels.len()),
            Encoding {
                x: Some(field(result, category, FieldType::Nominal)),
                y: Some(field(result, value, FieldType::Quantitative)),
                ..Encoding::default()
            },
        )
    };

    let mark = match kind {
        ChartKind::Arc => Mark::Arc,
        _ => Mark::Bar,
    };
    ChartHint {
        kind,
        reason,
        spec: ChartSpec {
            mark,
            title: None,
            transform: Vec::new(),
            encoding,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ColumnMeta;

    fn table(columns: &[(&str, Option<&str>)], rows: Vec<Vec<Value>>) -> QueryResult {
        let columns = columns.iter().map(|(n, t)| ColumnMeta::new(*n, *t)).collect();
        QueryResult::new(columns, rows, 1, false)
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn test_column_kinds() {
        let result = table(
            &[("Region", None), ("Order_Date", None), ("Year", None), ("Total", None)],
            vec![
                vec![text("North"), text("2024-01-01"), Value::Int(2024), Value::Float(10.5)],
                vec![text("South"), text("2024-01-02"), Value::Int(2023), Value::Int(7)],
            ],
        );
        assert_eq!(
            infer_column_kinds(&result),
            vec![
                ColumnKind::Nominal,
                ColumnKind::Temporal,
                ColumnKind::Temporal,
                ColumnKind::Quantitative
            ]
        );
    }

    #[test]
    fn test_text_only_gets_text_table() {
        let result = table(&[("Product_Name", None)], vec![vec![text("Bike")], vec![text("Helmet")]]);
        let hint = recommend_chart(&result);
        assert_eq!(hint.kind, ChartKind::TextTable);
        assert_eq!(hint.spec.mark, Mark::Text);
    }

    #[test]
    fn test_single_row_is_folded() {
        let result = table(
            &[("Sales", None), ("Profit", None)],
            vec![vec![Value::Int(1_000_000_000), Value::Int(3_000_000)]],
        );
        let hint = recommend_chart(&result);
        assert_eq!(hint.kind, ChartKind::MeltedBar);
        assert_eq!(hint.spec.transform[0].fold, vec!["Sales", "Profit"]);
        assert!(hint.spec.check_fields(&result).is_ok());
    }

    #[test]
    fn test_categorical_rules() {
        let few = table(
            &[("Category", None), ("Total", None)],
            vec![
                vec![text("Bikes"), Value::Int(10)],
                vec![text("Helmets"), Value::Int(20)],
                vec![text("Bottles"), Value::Int(15)],
            ],
        );
        assert_eq!(recommend_chart(&few).kind, ChartKind::Arc);

        let many_rows = (0..12).map(|i| vec![text(&format!("Office {}", i)), Value::Int(i)]).collect();
        let many = table(&[("Office_Name", None), ("Total_Discount", None)], many_rows);
        let hint = recommend_chart(&many);
        assert_eq!(hint.kind, ChartKind::HorizontalBar);
        assert_eq!(hint.spec.encoding.y.as_ref().unwrap().field, "Office_Name");

        let mid_rows = (0..8).map(|i| vec![text(&format!("P{}", i)), Value::Int(i)]).collect();
        let mid = table(&[("Product", None), ("Qty", None)], mid_rows);
        assert_eq!(recommend_chart(&mid).kind, ChartKind::Bar);
    }

    #[test]
    fn test_time_series_gets_line() {
        let result = table(
            &[("date", None), ("sales", None)],
            vec![
                vec![text("2024-01-01"), Value::Int(100)],
                vec![text("2024-01-02"), Value::Int(150)],
            ],
        );
        let hint = recommend_chart(&result);
        assert_eq!(hint.kind, ChartKind::Line);
        assert_eq!(hint.spec.encoding.x.as_ref().unwrap().field_type, FieldType::Temporal);
    }

    #[test]
    fn test_check_fields_rejects_unknown_columns() {
        let result = table(&[("category", None), ("value", None)], vec![vec![text("A"), Value::Int(1)]]);
        let spec: ChartSpec = serde_json::from_str(
            r#"{"mark": "bar", "encoding": {"x": {"field": "category", "type": "nominal"},
                "y": {"field": "revenue", "type": "quantitative"}}}"#,
        )
        .unwrap();
        assert_eq!(
            spec.check_fields(&result).unwrap_err(),
            "y encodes unknown field 'revenue'"
        );
    }

    #[test]
    fn test_unknown_keys_are_rejected_at_every_level() {
        let base = r#""mark": "bar", "encoding": {"x": {"field": "category", "type": "nominal"}}"#;
        assert!(serde_json::from_str::<ChartSpec>(&format!("{{{}}}", base)).is_ok());

        let inline_data = format!(r#"{{{}, "data": {{"values": [{{"category": "A"}}]}}}}"#, base);
        let err = serde_json::from_str::<ChartSpec>(&inline_data).unwrap_err();
        assert!(err.to_string().contains("unknown field `data`"), "{}", err);

        let field_extra = r#"{"mark": "bar", "encoding": {"x": {"field": "category", "type": "nominal", "aggregate": "sum"}}}"#;
        assert!(serde_json::from_str::<ChartSpec>(field_extra).is_err());

        let fold_extra = r#"{"mark": "bar", "transform": [{"fold": ["a"], "into": "b"}], "encoding": {}}"#;
        assert!(serde_json::from_str::<ChartSpec>(fold_extra).is_err());
    }
}
