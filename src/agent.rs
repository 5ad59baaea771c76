//! BI Agent
//!
//! Wires the question pipeline and exposes its single entry point:
//! question in, `{ sql, table, chart_spec, explanation }` or the failing stage
//! and reason out.

use crate::agent_prompts::{EXPLANATION_PROMPT, SQL_GENERATION_PROMPT, VISUALIZATION_PROMPT};
use crate::chart::ChartSpec;
use crate::config::AppConfig;
use crate::execution::{Database, ExecutionEngine, QueryExecutor, QueryResult};
use crate::generative::{ChartSpecParser, ExplanationParser, GenerativeStage, SqlDraftParser};
use crate::llm::Generator;
use crate::pipeline::{
    keys, PipelineError, PipelineRun, RunContext, RunStatus, SequentialPipeline, Stage, StageState,
};
use crate::schema::{CachedSchemaProvider, SchemaProvider};
use crate::stages::{DataFormatterStage, SchemaContextStage, SqlExecutorStage};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

const SQL_MAX_OUTPUT_TOKENS: u32 = 512;
const CHART_MAX_OUTPUT_TOKENS: u32 = 1024;
const EXPLANATION_MAX_OUTPUT_TOKENS: u32 = 400;

/// One answered question in a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub question: String,
    pub sql: String,
}

/// In-memory conversation memory keyed by an opaque session id. Keeps the
/// last `max_turns` answered turns per session.
pub struct SessionStore {
    sessions: DashMap<String, VecDeque<Turn>>,
    max_turns: usize,
}

impl SessionStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_turns,
        }
    }

    pub fn record(&self, session_id: &str, question: &str, sql: &str) {
        if self.max_turns == 0 {
            return;
        }
        let mut turns = self.sessions.entry(session_id.to_string()).or_default();
        turns.push_back(Turn {
            question: question.to_string(),
            sql: sql.to_string(),
        });
        while turns.len() > self.max_turns {
            turns.pop_front();
        }
    }

    pub fn turns(&self, session_id: &str) -> Vec<Turn> {
        self.sessions
            .get(session_id)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Conversation context for the SQL prompt
    pub fn render(&self, session_id: Option<&str>) -> String {
        let turns = session_id.map(|id| self.turns(id)).unwrap_or_default();
        if turns.is_empty() {
            return "(no previous questions)".to_string();
        }
        turns
            .iter()
            .enumerate()
            .map(|(i, turn)| format!("{}. Q: {}\n   SQL: {}", i + 1, turn.question, turn.sql))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What a caller gets back for one question.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Answered {
        run_id: Uuid,
        sql: String,
        table: QueryResult,
        chart_spec: ChartSpec,
        explanation: String,
    },
    Failed {
        run_id: Uuid,
        failed_at_stage: String,
        /// Outer stage first, down to the stage that actually failed
        stage_path: Vec<String>,
        code: String,
        reason: String,
    },
}

impl PipelineOutcome {
    pub fn from_run(run: &PipelineRun) -> Self {
        let failed = |stage: &str, path: Vec<String>, code: &str, reason: String| PipelineOutcome::Failed {
            run_id: run.run_id,
            failed_at_stage: stage.to_string(),
            stage_path: path,
            code: code.to_string(),
            reason,
        };

        match &run.status {
            RunStatus::Succeeded => {
                let sql = run.state.text(&keys::VALIDATED_SQL);
                let table = run.state.table(&keys::QUERY_RESULTS);
                let chart = run.state.chart(&keys::CHART_SPEC);
                let explanation = run.state.text(&keys::EXPLANATION_TEXT);
                match (sql, table, chart, explanation) {
                    (Some(sql), Some(table), Some(chart), Some(explanation)) => PipelineOutcome::Answered {
                        run_id: run.run_id,
                        sql: sql.to_string(),
                        table: table.as_ref().clone(),
                        chart_spec: chart.as_ref().clone(),
                        explanation: explanation.to_string(),
                    },
                    _ => failed(
                        &run.pipeline,
                        vec![run.pipeline.clone()],
                        "MissingOutput",
                        "pipeline finished without a complete answer".to_string(),
                    ),
                }
            }
            RunStatus::FailedAtStage(failure) => {
                let root = failure.root_error();
                failed(&failure.stage, failure.stage_path(), root.code(), root.to_string())
            }
            RunStatus::TimedOut { stage, budget, .. } => {
                let reason = match budget {
                    Some(budget) => format!("run budget of {:?} exhausted during '{}'", budget, stage),
                    None => format!("run deadline passed during '{}'", stage),
                };
                failed(stage, vec![stage.clone()], "TimedOut", reason)
            }
            RunStatus::Cancelled { stage, .. } => failed(
                stage,
                vec![stage.clone()],
                "Cancelled",
                format!("run cancelled during '{}'", stage),
            ),
        }
    }

    pub fn is_answered(&self) -> bool {
        matches!(self, PipelineOutcome::Answered { .. })
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            PipelineOutcome::Answered { run_id, .. } | PipelineOutcome::Failed { run_id, .. } => *run_id,
        }
    }
}

/// The SQL drafting stage, shared by the question pipeline and evaluation.
pub fn sql_generation_stage(generator: Arc<dyn Generator>) -> Result<Stage, PipelineError> {
    let stage = GenerativeStage::new(
        "sql_generation",
        vec![keys::SCHEMA_CONTEXT, keys::CONVERSATION_CONTEXT, keys::QUESTION],
        keys::SQL_QUERY,
        SQL_GENERATION_PROMPT,
        generator,
        SqlDraftParser,
    )?
    .with_max_output_tokens(SQL_MAX_OUTPUT_TOKENS);
    Ok(Stage::leaf(stage))
}

/// `visualization -> explanation`, run as one step of the outer pipeline.
pub fn insight_pipeline(generator: Arc<dyn Generator>, sample_rows: usize) -> Result<SequentialPipeline, PipelineError> {
    let visualization = GenerativeStage::new(
        "visualization",
        vec![keys::QUESTION, keys::FORMATTED_DATA, keys::CHART_HINT, keys::QUERY_RESULTS],
        keys::CHART_SPEC,
        VISUALIZATION_PROMPT,
        generator.clone(),
        ChartSpecParser,
    )?
    .with_max_output_tokens(CHART_MAX_OUTPUT_TOKENS)
    .with_table_rows(sample_rows);

    let explanation = GenerativeStage::new(
        "explanation",
        vec![keys::QUESTION, keys::FORMATTED_DATA, keys::CHART_SPEC],
        keys::EXPLANATION_TEXT,
        EXPLANATION_PROMPT,
        generator,
        ExplanationParser,
    )?
    .with_max_output_tokens(EXPLANATION_MAX_OUTPUT_TOKENS);

    SequentialPipeline::new(
        "insight_pipeline",
        vec![Stage::leaf(visualization), Stage::leaf(explanation)],
    )
}

/// Answers business questions against one database.
pub struct BiAgent {
    pipeline: SequentialPipeline,
    schema: Arc<CachedSchemaProvider>,
    executor: Arc<QueryExecutor>,
    sessions: SessionStore,
}

impl BiAgent {
    /// Build the question pipeline and check its key graph against the seed
    /// keys, so wiring mistakes surface here rather than on the first question.
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        catalog: Arc<dyn SchemaProvider>,
        generator: Arc<dyn Generator>,
        config: &AppConfig,
    ) -> Result<Self, PipelineError> {
        let schema = Arc::new(CachedSchemaProvider::new(catalog));
        let executor = Arc::new(QueryExecutor::new(engine, config.execution.clone()));

        let pipeline = SequentialPipeline::new(
            "bi_pipeline",
            vec![
                Stage::leaf(SchemaContextStage::new(schema.clone(), config.schema_max_tables)),
                sql_generation_stage(generator.clone())?,
                Stage::leaf(SqlExecutorStage::new(schema.clone(), executor.clone())),
                Stage::leaf(DataFormatterStage::new(config.sample_rows)),
                Stage::nested(insight_pipeline(generator, config.sample_rows)?),
            ],
        )?
        .with_budget(config.run_budget);
        pipeline.check_key_graph(&[keys::QUESTION, keys::CONVERSATION_CONTEXT])?;

        Ok(Self {
            pipeline,
            schema,
            executor,
            sessions: SessionStore::new(config.session_turns),
        })
    }

    pub fn from_database(
        database: &Database,
        generator: Arc<dyn Generator>,
        config: &AppConfig,
    ) -> Result<Self, PipelineError> {
        Self::new(database.engine.clone(), database.catalog.clone(), generator, config)
    }

    pub fn pipeline(&self) -> &SequentialPipeline {
        &self.pipeline
    }

    pub fn schema(&self) -> &Arc<CachedSchemaProvider> {
        &self.schema
    }

    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub async fn run_pipeline(&self, question: &str, session_id: Option<&str>) -> PipelineOutcome {
        self.run_with_cancel(question, session_id, CancellationToken::new()).await
    }

    /// Answer `question`; cancelling `cancel` stops the in-flight stage and
    /// releases whatever it holds.
    pub async fn run_with_cancel(
        &self,
        question: &str,
        session_id: Option<&str>,
        cancel: CancellationToken,
    ) -> PipelineOutcome {
        let question = question.trim();
        if question.is_empty() {
            return PipelineOutcome::Failed {
                run_id: Uuid::new_v4(),
                failed_at_stage: "input".to_string(),
                stage_path: vec!["input".to_string()],
                code: "InvalidInput".to_string(),
                reason: "question is empty".to_string(),
            };
        }

        let mut state = StageState::new();
        let seeded = state
            .insert("input", keys::QUESTION, question)
            .and_then(|_| state.insert("input", keys::CONVERSATION_CONTEXT, self.sessions.render(session_id)));
        if let Err(err) = seeded {
            return PipelineOutcome::Failed {
                run_id: Uuid::new_v4(),
                failed_at_stage: "input".to_string(),
                stage_path: vec!["input".to_string()],
                code: err.code().to_string(),
                reason: err.to_string(),
            };
        }

        let ctx = RunContext::new()
            .with_session(session_id.map(str::to_string))
            .with_cancel(cancel);
        let run = self.pipeline.run_with(state, ctx).await;
        let outcome = PipelineOutcome::from_run(&run);

        if let (PipelineOutcome::Answered { sql, .. }, Some(session)) = (&outcome, session_id) {
            self.sessions.record(session, question, sql);
        }
        info!(run_id = %run.run_id, status = %run.status, elapsed_ms = run.elapsed.as_millis() as u64, "Question handled");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_store_keeps_last_turns() {
        let store = SessionStore::new(2);
        store.record("s1", "q1", "SELECT 1");
        store.record("s1", "q2", "SELECT 2");
        store.record("s1", "q3", "SELECT 3");
        store.record("s2", "other", "SELECT 4");

        let turns = store.turns("s1");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].question, "q2");
        assert!(store.render(Some("s1")).contains("2. Q: q3"));
        assert_eq!(store.render(None), "(no previous questions)");

        store.clear("s1");
        assert!(store.turns("s1").is_empty());
        assert_eq!(store.turns("s2").len(), 1);
    }

    #[test]
    fn test_failed_outcome_serializes_with_status_tag() {
        let outcome = PipelineOutcome::Failed {
            run_id: Uuid::nil(),
            failed_at_stage: "sql_executor".to_string(),
            stage_path: vec!["sql_executor".to_string()],
            code: "ForbiddenOperation".to_string(),
            reason: "DELETE is not allowed".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["failed_at_stage"], "sql_executor");
        assert_eq!(json["code"], "ForbiddenOperation");
    }
}
