//! SQL Evaluation Harness
//!
//! Drafts SQL for a set of questions with known answers, runs both the draft
//! and the ground truth through the safety gate and the executor, and checks
//! that they return the same table.

use crate::agent::sql_generation_stage;
use crate::config::AppConfig;
use crate::error::Result;
use crate::execution::{QueryExecutor, QueryResult};
use crate::llm::Generator;
use crate::pipeline::{keys, PipelineError, RunStatus, SequentialPipeline, Stage, StageError, StageState};
use crate::schema::CachedSchemaProvider;
use crate::sql::SqlSafetyValidator;
use crate::stages::SchemaContextStage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalCase {
    pub question: String,
    pub ground_truth_sql: String,
}

pub fn load_cases(path: &Path) -> Result<Vec<EvalCase>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Correct,
    Mismatch { detail: String },
    DraftFailed { stage: String, code: String, reason: String },
    GroundTruthFailed { code: String, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub question: String,
    pub ground_truth_sql: String,
    pub generated_sql: Option<String>,
    #[serde(flatten)]
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationReport {
    pub cases: Vec<CaseReport>,
    pub correct: usize,
    pub total: usize,
}

impl EvaluationReport {
    pub fn score(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

/// First difference between two result tables, if any.
pub fn compare_results(generated: &QueryResult, expected: &QueryResult) -> Option<String> {
    if generated.column_names() != expected.column_names() {
        return Some(format!(
            "columns differ: got [{}], expected [{}]",
            generated.column_names().join(", "),
            expected.column_names().join(", ")
        ));
    }
    if generated.row_count() != expected.row_count() {
        return Some(format!(
            "row counts differ: got {}, expected {}",
            generated.row_count(),
            expected.row_count()
        ));
    }
    generated
        .rows()
        .iter()
        .zip(expected.rows())
        .position(|(a, b)| a != b)
        .map(|row| format!("row {} differs", row))
}

pub struct Evaluator {
    pipeline: SequentialPipeline,
    schema: Arc<CachedSchemaProvider>,
    executor: Arc<QueryExecutor>,
    pause: Duration,
}

impl Evaluator {
    pub fn new(
        schema: Arc<CachedSchemaProvider>,
        executor: Arc<QueryExecutor>,
        generator: Arc<dyn Generator>,
        config: &AppConfig,
    ) -> std::result::Result<Self, PipelineError> {
        let pipeline = SequentialPipeline::new(
            "sql_draft",
            vec![
                Stage::leaf(SchemaContextStage::new(schema.clone(), config.schema_max_tables)),
                sql_generation_stage(generator)?,
            ],
        )?
        .with_budget(config.run_budget);
        pipeline.check_key_graph(&[keys::QUESTION, keys::CONVERSATION_CONTEXT])?;

        Ok(Self {
            pipeline,
            schema,
            executor,
            pause: Duration::ZERO,
        })
    }

    /// Wait between cases, for rate-limited generators
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub async fn evaluate(&self, cases: &[EvalCase]) -> EvaluationReport {
        let mut report = EvaluationReport {
            total: cases.len(),
            ..EvaluationReport::default()
        };

        for (i, case) in cases.iter().enumerate() {
            if i > 0 && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
            let case_report = self.evaluate_case(case).await;
            if case_report.verdict == Verdict::Correct {
                report.correct += 1;
            }
            info!(case = i + 1, total = cases.len(), verdict = ?case_report.verdict, "Evaluated case");
            report.cases.push(case_report);
        }
        report
    }

    async fn evaluate_case(&self, case: &EvalCase) -> CaseReport {
        let report = |generated_sql: Option<String>, verdict: Verdict| CaseReport {
            question: case.question.clone(),
            ground_truth_sql: case.ground_truth_sql.clone(),
            generated_sql,
            verdict,
        };

        let generated_sql = match self.draft(&case.question).await {
            Ok(sql) => sql,
            Err((stage, error)) => {
                warn!(question = %case.question, stage = %stage, error = %error, "Draft failed");
                return report(
                    None,
                    Verdict::DraftFailed {
                        stage,
                        code: error.code().to_string(),
                        reason: error.to_string(),
                    },
                );
            }
        };

        let expected = match self.run_sql(&case.ground_truth_sql).await {
            Ok(result) => result,
            Err(error) => {
                return report(
                    Some(generated_sql),
                    Verdict::GroundTruthFailed {
                        code: error.code().to_string(),
                        reason: error.to_string(),
                    },
                )
            }
        };

        let verdict = match self.run_sql(&generated_sql).await {
            Ok(generated) => match compare_results(&generated, &expected) {
                None => Verdict::Correct,
                Some(detail) => Verdict::Mismatch { detail },
            },
            Err(error) => Verdict::DraftFailed {
                stage: "sql_executor".to_string(),
                code: error.code().to_string(),
                reason: error.to_string(),
            },
        };
        report(Some(generated_sql), verdict)
    }

    async fn draft(&self, question: &str) -> std::result::Result<String, (String, StageError)> {
        let mut state = StageState::new();
        state
            .insert("input", keys::QUESTION, question)
            .and_then(|_| state.insert("input", keys::CONVERSATION_CONTEXT, "(no previous questions)"))
            .map_err(|e| ("input".to_string(), StageError::Wiring(e)))?;

        let run = self.pipeline.run(state).await;
        match run.status {
            RunStatus::Succeeded => run
                .state
                .text(&keys::SQL_QUERY)
                .map(str::to_string)
                .ok_or_else(|| {
                    let missing = PipelineError::MissingOutput {
                        stage: "sql_generation".to_string(),
                        key: keys::SQL_QUERY.to_string(),
                    };
                    ("sql_generation".to_string(), StageError::Wiring(missing))
                }),
            RunStatus::FailedAtStage(failure) => Err((failure.stage.clone(), failure.root_error().clone())),
            RunStatus::TimedOut { stage, .. } | RunStatus::Cancelled { stage, .. } => {
                Err((stage.clone(), StageError::Interrupted { stage }))
            }
        }
    }

    async fn run_sql(&self, sql: &str) -> std::result::Result<QueryResult, StageError> {
        let snapshot = self.schema.snapshot().await?;
        let validator = SqlSafetyValidator::new(snapshot, self.executor.policy().max_rows);
        let query = validator.validate(sql)?;
        Ok(self.executor.execute(&query).await?)
    }
}
