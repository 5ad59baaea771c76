//! Generative Stages
//!
//! Wraps one generator call as a pipeline stage: render the prompt from the
//! declared inputs, call the generator once, parse the raw text into the
//! stage's single output. Generator and parse failures both surface as
//! `MalformedGeneration`.

use crate::chart::ChartSpec;
use crate::llm::{GenerationRequest, Generator};
use crate::pipeline::{
    keys, PipelineError, PipelineStage, RunContext, StageDescriptor, StageError, StageOutputs, StateKey,
    StateValue, StateView,
};
use crate::sql::lexer::tokenize;
use async_trait::async_trait;
use sqlparser::tokenizer::Token as SqlToken;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1024;
/// Rows of a table input rendered into a prompt
const DEFAULT_PROMPT_TABLE_ROWS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(StateKey),
}

/// Prompt text with `{key}` placeholders; `{{` and `}}` are literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    segments: Vec<Segment>,
    table_rows: usize,
}

impl PromptTemplate {
    /// Parse `source`, checking every placeholder against `declared`.
    pub fn parse(stage: &str, source: &str, declared: &[StateKey]) -> Result<Self, PipelineError> {
        let unknown = |placeholder: &str| PipelineError::UnknownPlaceholder {
            stage: stage.to_string(),
            placeholder: placeholder.to_string(),
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for next in chars.by_ref() {
                        if next == '}' {
                            closed = true;
                            break;
                        }
                        name.push(next);
                    }
                    let valid = closed
                        && !name.is_empty()
                        && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
                    if !valid {
                        return Err(unknown(&name));
                    }
                    let key = declared
                        .iter()
                        .find(|k| k.as_str() == name)
                        .ok_or_else(|| unknown(&name))?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Slot(key.clone()));
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            segments,
            table_rows: DEFAULT_PROMPT_TABLE_ROWS,
        })
    }

    pub fn with_table_rows(mut self, rows: usize) -> Self {
        self.table_rows = rows;
        self
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &StateKey> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Slot(key) => Some(key),
            Segment::Literal(_) => None,
        })
    }

    /// Materialise the prompt from the stage's view of state.
    pub fn render(&self, view: StateView<'_>) -> Result<String, PipelineError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(key) => match view.get(key)? {
                    StateValue::Text(text) => out.push_str(text),
                    StateValue::Table(table) => {
                        let records = table.to_json_records(self.table_rows);
                        out.push_str(&serde_json::to_string_pretty(&records).unwrap_or_default());
                    }
                    StateValue::Chart(chart) => {
                        out.push_str(&serde_json::to_string_pretty(chart.as_ref()).unwrap_or_default());
                    }
                },
            }
        }
        Ok(out)
    }
}

/// Turns raw generator text into the stage's output value.
pub trait OutputParser: Send + Sync {
    fn parse(&self, raw: &str, view: StateView<'_>) -> Result<StateValue, StageError>;
}

/// Remove a Markdown code fence when it wraps the whole response.
pub fn strip_fences(raw: &str) -> &str {
    let text = raw.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Words a SQL statement may open with. Anything else is prose.
const STATEMENT_WORDS: &[&str] = &[
    "SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "MERGE", "DROP", "ALTER", "CREATE", "TRUNCATE",
    "EXEC", "EXECUTE", "DECLARE", "SET", "USE", "GRANT", "REVOKE", "DENY", "BACKUP", "RESTORE",
    "WAITFOR", "DBCC", "BULK", "SHUTDOWN", "KILL", "ATTACH", "DETACH", "PRAGMA",
];

/// A bare SQL statement. The draft is not judged for safety here; forbidden
/// statements still parse so the validator can reject them by name.
pub struct SqlDraftParser;

impl OutputParser for SqlDraftParser {
    fn parse(&self, raw: &str, _view: StateView<'_>) -> Result<StateValue, StageError> {
        let sql = strip_fences(raw);
        let lexed = tokenize(sql);
        let opens_statement = match lexed.tokens.first() {
            Some(token) if token.is_word() => STATEMENT_WORDS.iter().any(|w| token.is_keyword(w)),
            Some(token) => token.token == SqlToken::LParen,
            None => false,
        };
        if !opens_statement {
            let preview: String = sql.chars().take(80).collect();
            return Err(StageError::malformed(format!(
                "expected a bare SQL statement, got: {}",
                preview
            )));
        }
        Ok(StateValue::Text(sql.to_string()))
    }
}

/// A JSON chart spec whose fields exist in `query_results`.
pub struct ChartSpecParser;

impl OutputParser for ChartSpecParser {
    fn parse(&self, raw: &str, view: StateView<'_>) -> Result<StateValue, StageError> {
        let text = strip_fences(raw);
        let spec: ChartSpec = serde_json::from_str(text)
            .map_err(|e| StageError::malformed(format!("chart spec is not valid JSON: {}", e)))?;
        let table = view.table(&keys::QUERY_RESULTS)?;
        spec.check_fields(table).map_err(StageError::malformed)?;
        Ok(StateValue::Chart(Arc::new(spec)))
    }
}

/// Non-empty prose.
pub struct ExplanationParser;

impl OutputParser for ExplanationParser {
    fn parse(&self, raw: &str, _view: StateView<'_>) -> Result<StateValue, StageError> {
        let text = strip_fences(raw);
        if text.is_empty() {
            return Err(StageError::malformed("explanation is empty"));
        }
        Ok(StateValue::Text(text.to_string()))
    }
}

pub struct GenerativeStage<P> {
    descriptor: StageDescriptor,
    template: PromptTemplate,
    generator: Arc<dyn Generator>,
    parser: P,
    max_output_tokens: u32,
}

impl<P: OutputParser> GenerativeStage<P> {
    /// Build the stage; fails if the template names a key outside `inputs`.
    pub fn new(
        name: &str,
        inputs: Vec<StateKey>,
        output: StateKey,
        template: &str,
        generator: Arc<dyn Generator>,
        parser: P,
    ) -> Result<Self, PipelineError> {
        let template = PromptTemplate::parse(name, template, &inputs)?;
        Ok(Self {
            descriptor: StageDescriptor::leaf(name, inputs, [output]),
            template,
            generator,
            parser,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        })
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn with_table_rows(mut self, rows: usize) -> Self {
        self.template = self.template.with_table_rows(rows);
        self
    }
}

#[async_trait]
impl<P: OutputParser + 'static> PipelineStage for GenerativeStage<P> {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn run(&self, view: StateView<'_>, ctx: &RunContext) -> Result<StageOutputs, StageError> {
        let stage = self.descriptor.name.as_str();
        let prompt = self.template.render(view)?;
        debug!(run_id = %ctx.run_id, stage, prompt = %prompt, "Rendered prompt");

        let raw = self
            .generator
            .generate(GenerationRequest {
                stage: stage.to_string(),
                prompt,
                max_output_tokens: self.max_output_tokens,
            })
            .await
            .map_err(|e| {
                warn!(run_id = %ctx.run_id, stage, error = %e, "Generator call failed");
                StageError::malformed(e.to_string())
            })?;
        debug!(run_id = %ctx.run_id, stage, response = %raw, "Generator responded");

        let value = self.parser.parse(&raw, view)?;
        info!(run_id = %ctx.run_id, stage, generator = self.generator.name(), "Generation parsed");

        let output = self.descriptor.outputs[0].clone();
        Ok(StageOutputs::new().with(output, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ColumnMeta, QueryResult, Value};
    use crate::llm::{GeneratorError, ScriptedGenerator};
    use crate::pipeline::StageState;

    #[test]
    fn test_template_placeholders_and_escapes() {
        let declared = [keys::QUESTION, keys::SCHEMA_CONTEXT];
        let template =
            PromptTemplate::parse("sql_generation", "{schema_context}\nQ: {question} {{literal}}", &declared).unwrap();

        let mut state = StageState::new();
        state.insert("input", keys::QUESTION, "top 5?").unwrap();
        state.insert("input", keys::SCHEMA_CONTEXT, "Table: Products").unwrap();
        let rendered = template.render(state.view("sql_generation", &declared)).unwrap();
        assert_eq!(rendered, "Table: Products\nQ: top 5? {literal}");
        assert_eq!(template.placeholders().count(), 2);
    }

    #[test]
    fn test_template_rejects_undeclared_placeholder() {
        let err = PromptTemplate::parse("explanation", "Data: {query_results}", &[keys::QUESTION]).unwrap_err();
        assert_eq!(
            err,
            PipelineError::UnknownPlaceholder {
                stage: "explanation".to_string(),
                placeholder: "query_results".to_string()
            }
        );
        assert!(PromptTemplate::parse("x", "unclosed {question", &[keys::QUESTION]).is_err());
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("```sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(strip_fences("  SELECT 1  "), "SELECT 1");
        assert_eq!(strip_fences("```\nhello\n```\n"), "hello");
    }

    #[test]
    fn test_sql_draft_parser() {
        let state = StageState::new();
        let view = state.view("sql_generation", &[]);
        let parsed = SqlDraftParser.parse("```sql\nSELECT TOP 5 * FROM Products\n```", view).unwrap();
        assert!(matches!(parsed, StateValue::Text(ref s) if s == "SELECT TOP 5 * FROM Products"));
        assert!(SqlDraftParser.parse("DELETE FROM Products", view).is_ok());

        let err = SqlDraftParser
            .parse("Here is the query you asked for: SELECT 1", view)
            .unwrap_err();
        assert_eq!(err.code(), "MalformedGeneration");
    }

    #[test]
    fn test_chart_parser_checks_fields() {
        let table = QueryResult::new(
            vec![ColumnMeta::new("category", None), ColumnMeta::new("value", None)],
            vec![vec![Value::Text("A".to_string()), Value::Int(10)]],
            1,
            false,
        );
        let mut state = StageState::new();
        state.insert("sql_executor", keys::QUERY_RESULTS, table).unwrap();
        let declared = [keys::QUERY_RESULTS];
        let view = state.view("visualization", &declared);

        let good = r#"{"mark": "bar", "encoding": {"x": {"field": "category", "type": "nominal"}, "y": {"field": "value", "type": "quantitative"}}}"#;
        assert!(matches!(ChartSpecParser.parse(good, view).unwrap(), StateValue::Chart(_)));

        let prose = "import altair as alt\nchart = alt.Chart(df)";
        assert_eq!(ChartSpecParser.parse(prose, view).unwrap_err().code(), "MalformedGeneration");

        let with_data = r#"{"mark": "bar", "data": {"values": []}, "encoding": {"x": {"field": "category", "type": "nominal"}}}"#;
        assert_eq!(ChartSpecParser.parse(with_data, view).unwrap_err().code(), "MalformedGeneration");
    }

    #[tokio::test]
    async fn test_generator_failure_is_malformed_generation() {
        let generator = Arc::new(ScriptedGenerator::new().fail("explanation", GeneratorError::Timeout(std::time::Duration::from_secs(60))));
        let stage = GenerativeStage::new(
            "explanation",
            vec![keys::QUESTION],
            keys::EXPLANATION_TEXT,
            "Explain: {question}",
            generator.clone(),
            ExplanationParser,
        )
        .unwrap();

        let mut state = StageState::new();
        state.insert("input", keys::QUESTION, "why?").unwrap();
        let declared = [keys::QUESTION];
        let err = stage
            .run(state.view("explanation", &declared), &RunContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MalformedGeneration");
        assert_eq!(generator.calls("explanation"), 1);
        assert_eq!(generator.prompts()[0].1, "Explain: why?");
    }
}
