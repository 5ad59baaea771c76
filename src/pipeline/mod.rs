//! Pipeline Orchestration
//!
//! A pipeline is an ordered line of stages. Each stage declares the state keys
//! it reads and the keys it writes; the executor checks the whole key graph
//! before the first stage runs, then invokes stages one at a time and merges
//! their outputs into a write-once state bag. A nested pipeline is just another
//! stage.

pub mod sequential;
pub mod stage;
pub mod state;

pub use sequential::{PipelineRun, RunStatus, SequentialPipeline, StageTiming};
pub use stage::{
    PipelineStage, RunContext, Stage, StageDescriptor, StageError, StageFailure, StageKind,
};
pub use state::{keys, StageOutputs, StageState, StateKey, StateValue, StateView};

use thiserror::Error;

/// Wiring errors: a stage list or a stage's behaviour disagrees with the
/// declared key graph. These are programmer errors and should surface at
/// startup through [`SequentialPipeline::check_key_graph`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("pipeline '{pipeline}' has no stages")]
    EmptyPipeline { pipeline: String },

    #[error("stage '{stage}' needs '{key}' but no earlier stage or seed provides it")]
    MissingDependency { stage: String, key: String },

    #[error("stage '{stage}' writes '{key}' which is already set")]
    DuplicateKey { stage: String, key: String },

    #[error("stage '{stage}' returned '{key}' which it does not declare as an output")]
    UndeclaredOutput { stage: String, key: String },

    #[error("stage '{stage}' finished without producing '{key}'")]
    MissingOutput { stage: String, key: String },

    #[error("stage '{stage}' tried to read '{key}' which it does not declare as an input")]
    UndeclaredRead { stage: String, key: String },

    #[error("stage '{stage}' expected {expected} under '{key}' but found {found}")]
    TypeMismatch {
        stage: String,
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("prompt for stage '{stage}' uses placeholder '{{{placeholder}}}' which is not a declared input")]
    UnknownPlaceholder { stage: String, placeholder: String },
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::EmptyPipeline { .. } => "EmptyPipeline",
            PipelineError::MissingDependency { .. } => "MissingDependency",
            PipelineError::DuplicateKey { .. } => "DuplicateKey",
            PipelineError::UndeclaredOutput { .. } => "UndeclaredOutput",
            PipelineError::MissingOutput { .. } => "MissingOutput",
            PipelineError::UndeclaredRead { .. } => "UndeclaredRead",
            PipelineError::TypeMismatch { .. } => "TypeMismatch",
            PipelineError::UnknownPlaceholder { .. } => "UnknownPlaceholder",
        }
    }
}
