//! Stage State
//!
//! The write-once key/value bag threaded through one pipeline run.

use super::PipelineError;
use crate::chart::ChartSpec;
use crate::execution::QueryResult;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Name of a state slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey(Cow<'static, str>);

impl StateKey {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keys used by the question-answering pipeline
pub mod keys {
    use super::StateKey;

    pub const QUESTION: StateKey = StateKey::from_static("question");
    pub const CONVERSATION_CONTEXT: StateKey = StateKey::from_static("conversation_context");
    pub const SCHEMA_CONTEXT: StateKey = StateKey::from_static("schema_context");
    pub const SQL_QUERY: StateKey = StateKey::from_static("sql_query");
    pub const VALIDATED_SQL: StateKey = StateKey::from_static("validated_sql");
    pub const QUERY_RESULTS: StateKey = StateKey::from_static("query_results");
    pub const FORMATTED_DATA: StateKey = StateKey::from_static("formatted_data");
    pub const CHART_HINT: StateKey = StateKey::from_static("chart_hint");
    pub const CHART_SPEC: StateKey = StateKey::from_static("chart_spec");
    pub const EXPLANATION_TEXT: StateKey = StateKey::from_static("explanation_text");
}

/// A value stored in the state bag. Tables and charts are shared by reference.
#[derive(Debug, Clone)]
pub enum StateValue {
    Text(String),
    Table(Arc<QueryResult>),
    Chart(Arc<ChartSpec>),
}

impl StateValue {
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Text(_) => "text",
            StateValue::Table(_) => "table",
            StateValue::Chart(_) => "chart",
        }
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::Text(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::Text(value.to_string())
    }
}

impl From<QueryResult> for StateValue {
    fn from(value: QueryResult) -> Self {
        StateValue::Table(Arc::new(value))
    }
}

impl From<ChartSpec> for StateValue {
    fn from(value: ChartSpec) -> Self {
        StateValue::Chart(Arc::new(value))
    }
}

/// Ordered, append-only mapping from key to value.
///
/// Insertion order is kept so the final state reads in the order stages ran.
/// A key can be written exactly once.
#[derive(Debug, Clone, Default)]
pub struct StageState {
    entries: Vec<(StateKey, StateValue)>,
    index: HashMap<StateKey, usize>,
}

impl StageState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `key`, attributing the write to `writer` in errors.
    pub fn insert(
        &mut self,
        writer: &str,
        key: StateKey,
        value: impl Into<StateValue>,
    ) -> Result<(), PipelineError> {
        if self.index.contains_key(&key) {
            return Err(PipelineError::DuplicateKey {
                stage: writer.to_string(),
                key: key.to_string(),
            });
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value.into()));
        Ok(())
    }

    pub fn contains(&self, key: &StateKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &StateKey) -> Option<&StateValue> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn text(&self, key: &StateKey) -> Option<&str> {
        match self.get(key) {
            Some(StateValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn table(&self, key: &StateKey) -> Option<&Arc<QueryResult>> {
        match self.get(key) {
            Some(StateValue::Table(table)) => Some(table),
            _ => None,
        }
    }

    pub fn chart(&self, key: &StateKey) -> Option<&Arc<ChartSpec>> {
        match self.get(key) {
            Some(StateValue::Chart(chart)) => Some(chart),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &StateKey> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, &StateValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read-only view limited to the keys a stage declared.
    pub fn view<'a>(&'a self, stage: &'a str, declared: &'a [StateKey]) -> StateView<'a> {
        StateView {
            state: self,
            stage,
            declared,
        }
    }
}

/// What a stage sees of the state: only its declared inputs, read-only.
#[derive(Debug, Clone, Copy)]
pub struct StateView<'a> {
    state: &'a StageState,
    stage: &'a str,
    declared: &'a [StateKey],
}

impl<'a> StateView<'a> {
    pub fn stage(&self) -> &'a str {
        self.stage
    }

    pub fn declared(&self) -> &'a [StateKey] {
        self.declared
    }

    pub fn get(&self, key: &StateKey) -> Result<&'a StateValue, PipelineError> {
        if !self.declared.contains(key) {
            return Err(PipelineError::UndeclaredRead {
                stage: self.stage.to_string(),
                key: key.to_string(),
            });
        }
        self.state.get(key).ok_or_else(|| PipelineError::MissingDependency {
            stage: self.stage.to_string(),
            key: key.to_string(),
        })
    }

    pub fn text(&self, key: &StateKey) -> Result<&'a str, PipelineError> {
        match self.get(key)? {
            StateValue::Text(text) => Ok(text),
            other => Err(self.mismatch(key, "text", other)),
        }
    }

    pub fn table(&self, key: &StateKey) -> Result<&'a Arc<QueryResult>, PipelineError> {
        match self.get(key)? {
            StateValue::Table(table) => Ok(table),
            other => Err(self.mismatch(key, "table", other)),
        }
    }

    pub fn chart(&self, key: &StateKey) -> Result<&'a Arc<ChartSpec>, PipelineError> {
        match self.get(key)? {
            StateValue::Chart(chart) => Ok(chart),
            other => Err(self.mismatch(key, "chart", other)),
        }
    }

    fn mismatch(&self, key: &StateKey, expected: &'static str, found: &StateValue) -> PipelineError {
        PipelineError::TypeMismatch {
            stage: self.stage.to_string(),
            key: key.to_string(),
            expected,
            found: found.kind(),
        }
    }
}

/// Values a stage hands back to the executor for merging.
#[derive(Debug, Clone, Default)]
pub struct StageOutputs {
    entries: Vec<(StateKey, StateValue)>,
}

impl StageOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: StateKey, value: impl Into<StateValue>) -> Self {
        self.entries.push((key, value.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<(StateKey, StateValue)> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_write_once() {
        let mut state = StageState::new();
        state.insert("input", keys::QUESTION, "top products?").unwrap();
        let err = state.insert("rewriter", keys::QUESTION, "something else").unwrap_err();
        assert_eq!(
            err,
            PipelineError::DuplicateKey {
                stage: "rewriter".to_string(),
                key: "question".to_string()
            }
        );
        assert_eq!(state.text(&keys::QUESTION), Some("top products?"));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_static_and_owned_keys_are_equal() {
        let mut state = StageState::new();
        state.insert("input", StateKey::new("question"), "q").unwrap();
        assert!(state.contains(&keys::QUESTION));
    }

    #[test]
    fn test_insertion_order_is_kept() {
        let mut state = StageState::new();
        state.insert("a", keys::SQL_QUERY, "SELECT 1").unwrap();
        state.insert("a", keys::QUESTION, "q").unwrap();
        let order: Vec<&str> = state.keys().map(|k| k.as_str()).collect();
        assert_eq!(order, vec!["sql_query", "question"]);
    }

    #[test]
    fn test_view_only_exposes_declared_keys() {
        let mut state = StageState::new();
        state.insert("input", keys::QUESTION, "q").unwrap();
        state.insert("input", keys::SCHEMA_CONTEXT, "Database Schema:").unwrap();

        let declared = [keys::QUESTION, keys::SQL_QUERY];
        let view = state.view("sql_generation", &declared);

        assert_eq!(view.text(&keys::QUESTION).unwrap(), "q");
        assert_eq!(
            view.text(&keys::SCHEMA_CONTEXT).unwrap_err().code(),
            "UndeclaredRead"
        );
        assert_eq!(
            view.text(&keys::SQL_QUERY).unwrap_err().code(),
            "MissingDependency"
        );
        assert_eq!(view.table(&keys::QUESTION).unwrap_err().code(), "TypeMismatch");
    }
}
