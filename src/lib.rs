pub mod agent;
pub mod agent_prompts;
pub mod chart;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod execution;
pub mod generative;
pub mod llm;
pub mod pipeline;
pub mod schema;
pub mod sql;
pub mod stages;

pub use agent::{BiAgent, PipelineOutcome, SessionStore};
pub use config::{AppConfig, ExecutionPolicy};
pub use error::{BiError, Result};
pub use execution::{connect, Database, ExecutionError, ExecutionErrorKind, QueryExecutor, QueryResult};
pub use llm::{Generator, OpenAiGenerator, ScriptedGenerator};
pub use pipeline::{PipelineError, PipelineRun, RunStatus, SequentialPipeline, Stage, StageError, StageState};
pub use sql::{RejectionReason, SqlSafetyValidator, ValidatedQuery};
