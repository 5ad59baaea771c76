//! Pipeline Stages
//!
//! The stage capability, its static descriptor, the run context handed to every
//! stage, and the error a stage may fail with.

use super::sequential::{RunStatus, SequentialPipeline};
use super::state::{StageOutputs, StageState, StateKey, StateView};
use super::PipelineError;
use crate::execution::ExecutionError;
use crate::schema::SchemaError;
use crate::sql::RejectionReason;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Leaf,
    Nested,
}

/// Static metadata for a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: String,
    /// Keys that must already be in state before the stage runs
    pub inputs: Vec<StateKey>,
    /// Keys the stage writes; each exactly once
    pub outputs: Vec<StateKey>,
    pub kind: StageKind,
}

impl StageDescriptor {
    pub fn leaf(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = StateKey>,
        outputs: impl IntoIterator<Item = StateKey>,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
            kind: StageKind::Leaf,
        }
    }
}

/// Per-run context: identity, cancellation and the optional deadline.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub session_id: Option<String>,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            session_id: None,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Tighten the deadline to `now + budget`; an earlier deadline wins.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        let candidate = Instant::now() + budget;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error(transparent)]
    Wiring(#[from] PipelineError),

    #[error(transparent)]
    Rejected(#[from] RejectionReason),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("malformed generation: {detail}")]
    MalformedGeneration { detail: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("{0}")]
    Nested(Box<StageFailure>),

    #[error("stage '{stage}' was interrupted before it finished")]
    Interrupted { stage: String },
}

impl StageError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        StageError::MalformedGeneration {
            detail: detail.into(),
        }
    }

    /// Stable machine code, reported verbatim to callers
    pub fn code(&self) -> &'static str {
        match self {
            StageError::Wiring(e) => e.code(),
            StageError::Rejected(r) => r.code(),
            StageError::Execution(e) => e.kind.code(),
            StageError::MalformedGeneration { .. } => "MalformedGeneration",
            StageError::Schema(_) => "SchemaUnavailable",
            StageError::Nested(failure) => failure.error.code(),
            StageError::Interrupted { .. } => "Interrupted",
        }
    }
}

/// A stage failure located in its pipeline.
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub index: usize,
    pub stage: String,
    pub error: StageError,
}

impl StageFailure {
    /// Stage names from the outer pipeline down to the stage that actually failed.
    pub fn stage_path(&self) -> Vec<String> {
        let mut path = vec![self.stage.clone()];
        let mut error = &self.error;
        while let StageError::Nested(inner) = error {
            path.push(inner.stage.clone());
            error = &inner.error;
        }
        path
    }

    /// The innermost error, with nested wrappers peeled off.
    pub fn root_error(&self) -> &StageError {
        let mut error = &self.error;
        while let StageError::Nested(inner) = error {
            error = &inner.error;
        }
        error
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage '{}' (#{}) failed: {}", self.stage, self.index, self.error)
    }
}

/// One named transformation step.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn descriptor(&self) -> &StageDescriptor;

    /// Produce the declared outputs from the declared inputs.
    async fn run(&self, view: StateView<'_>, ctx: &RunContext) -> Result<StageOutputs, StageError>;
}

/// A pipeline entry: a leaf action or a whole inner pipeline run as one step.
pub enum Stage {
    Leaf(Arc<dyn PipelineStage>),
    Nested(NestedPipeline),
}

/// An inner pipeline seen from the outside: it reads the keys its stages need
/// from outside and writes every key its stages produce.
pub struct NestedPipeline {
    pipeline: SequentialPipeline,
    descriptor: StageDescriptor,
}

impl Stage {
    pub fn leaf(stage: impl PipelineStage + 'static) -> Self {
        Stage::Leaf(Arc::new(stage))
    }

    pub fn nested(pipeline: SequentialPipeline) -> Self {
        let descriptor = StageDescriptor {
            name: pipeline.name().to_string(),
            inputs: pipeline.external_inputs(),
            outputs: pipeline.produced_keys(),
            kind: StageKind::Nested,
        };
        Stage::Nested(NestedPipeline {
            pipeline,
            descriptor,
        })
    }

    pub fn descriptor(&self) -> &StageDescriptor {
        match self {
            Stage::Leaf(stage) => stage.descriptor(),
            Stage::Nested(nested) => &nested.descriptor,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor().name
    }

    pub(crate) async fn invoke(
        &self,
        view: StateView<'_>,
        ctx: &RunContext,
    ) -> Result<StageOutputs, StageError> {
        match self {
            Stage::Leaf(stage) => stage.run(view, ctx).await,
            Stage::Nested(nested) => nested.invoke(view, ctx).await,
        }
    }
}

impl NestedPipeline {
    async fn invoke(&self, view: StateView<'_>, ctx: &RunContext) -> Result<StageOutputs, StageError> {
        let mut inner = StageState::new();
        for key in &self.descriptor.inputs {
            inner.insert(&self.descriptor.name, key.clone(), view.get(key)?.clone())?;
        }

        let drive = self.pipeline.drive(inner, ctx, false).await;
        match drive.status {
            RunStatus::Succeeded => {
                let mut outputs = StageOutputs::new();
                for key in &self.descriptor.outputs {
                    if let Some(value) = drive.state.get(key) {
                        outputs = outputs.with(key.clone(), value.clone());
                    }
                }
                Ok(outputs)
            }
            RunStatus::FailedAtStage(failure) => Err(StageError::Nested(Box::new(failure))),
            RunStatus::TimedOut { stage, .. } | RunStatus::Cancelled { stage, .. } => {
                Err(StageError::Interrupted { stage })
            }
        }
    }
}
