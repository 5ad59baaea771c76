//! Sequential Pipeline
//!
//! Fail-fast executor over an ordered stage list.

use super::stage::{RunContext, Stage, StageError, StageFailure};
use super::state::{StageState, StateKey};
use super::PipelineError;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Terminal status of a run.
#[derive(Debug, Clone)]
pub enum RunStatus {
    Succeeded,
    FailedAtStage(StageFailure),
    TimedOut {
        stage: String,
        index: usize,
        budget: Option<Duration>,
    },
    Cancelled {
        stage: String,
        index: usize,
    },
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }

    /// Name of the stage the run stopped at, if it stopped early
    pub fn stopped_at(&self) -> Option<&str> {
        match self {
            RunStatus::Succeeded => None,
            RunStatus::FailedAtStage(failure) => Some(&failure.stage),
            RunStatus::TimedOut { stage, .. } | RunStatus::Cancelled { stage, .. } => Some(stage),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::FailedAtStage(failure) => write!(f, "failed-at-stage({})", failure.stage),
            RunStatus::TimedOut { stage, .. } => write!(f, "timed-out({})", stage),
            RunStatus::Cancelled { stage, .. } => write!(f, "cancelled({})", stage),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageTiming {
    pub stage: String,
    pub elapsed: Duration,
}

/// One execution of a pipeline. Owns the state it produced.
#[derive(Debug)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    pub state: StageState,
    pub timings: Vec<StageTiming>,
    pub elapsed: Duration,
}

impl PipelineRun {
    pub fn succeeded(&self) -> bool {
        self.status.is_success()
    }
}

pub(crate) struct Drive {
    pub(crate) state: StageState,
    pub(crate) timings: Vec<StageTiming>,
    pub(crate) status: RunStatus,
}

/// A line of stages. Stage `i` may only read keys written by stages before it
/// or supplied in the initial state.
pub struct SequentialPipeline {
    name: String,
    stages: Vec<Stage>,
    /// Keys read but not produced inside the pipeline, with the first reader
    external: Vec<(StateKey, usize)>,
    budget: Option<Duration>,
}

impl SequentialPipeline {
    /// Build a pipeline, rejecting empty lists, keys written twice and reads
    /// of keys that only a later stage produces.
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Result<Self, PipelineError> {
        let name = name.into();
        if stages.is_empty() {
            return Err(PipelineError::EmptyPipeline { pipeline: name });
        }

        let mut producer: HashMap<&StateKey, usize> = HashMap::new();
        for (index, stage) in stages.iter().enumerate() {
            for key in &stage.descriptor().outputs {
                if producer.insert(key, index).is_some() {
                    return Err(PipelineError::DuplicateKey {
                        stage: stage.name().to_string(),
                        key: key.to_string(),
                    });
                }
            }
        }

        let mut external: Vec<(StateKey, usize)> = Vec::new();
        for (index, stage) in stages.iter().enumerate() {
            for key in &stage.descriptor().inputs {
                match producer.get(key) {
                    Some(&writer) if writer < index => {}
                    Some(_) => {
                        return Err(PipelineError::MissingDependency {
                            stage: stage.name().to_string(),
                            key: key.to_string(),
                        })
                    }
                    None => {
                        if !external.iter().any(|(k, _)| k == key) {
                            external.push((key.clone(), index));
                        }
                    }
                }
            }
        }

        Ok(Self {
            name,
            stages,
            external,
            budget: None,
        })
    }

    /// Overall wall-clock budget applied when this pipeline runs at top level.
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Keys the pipeline needs from its caller.
    pub fn external_inputs(&self) -> Vec<StateKey> {
        self.external.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Every key the pipeline's stages write, in stage order.
    pub fn produced_keys(&self) -> Vec<StateKey> {
        self.stages
            .iter()
            .flat_map(|s| s.descriptor().outputs.iter().cloned())
            .collect()
    }

    /// Check the key graph against the keys a run will be seeded with.
    pub fn check_key_graph<'k>(
        &self,
        available: impl IntoIterator<Item = &'k StateKey>,
    ) -> Result<(), PipelineError> {
        match self.key_graph_violation(available) {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }

    fn key_graph_violation<'k>(
        &self,
        available: impl IntoIterator<Item = &'k StateKey>,
    ) -> Option<(usize, PipelineError)> {
        let available: HashSet<&StateKey> = available.into_iter().collect();

        for (key, reader) in &self.external {
            if !available.contains(key) {
                return Some((
                    *reader,
                    PipelineError::MissingDependency {
                        stage: self.stages[*reader].name().to_string(),
                        key: key.to_string(),
                    },
                ));
            }
        }

        for (index, stage) in self.stages.iter().enumerate() {
            for key in &stage.descriptor().outputs {
                if available.contains(key) {
                    return Some((
                        index,
                        PipelineError::DuplicateKey {
                            stage: stage.name().to_string(),
                            key: key.to_string(),
                        },
                    ));
                }
            }
        }

        None
    }

    pub async fn run(&self, initial: StageState) -> PipelineRun {
        self.run_with(initial, RunContext::new()).await
    }

    /// Run every stage in order against `initial`, honouring the context's
    /// cancellation token and the earlier of its deadline and this pipeline's budget.
    pub async fn run_with(&self, initial: StageState, ctx: RunContext) -> PipelineRun {
        let started = Instant::now();
        let ctx = match self.budget {
            Some(budget) => ctx.with_budget(budget),
            None => ctx,
        };

        info!(run_id = %ctx.run_id, pipeline = %self.name, stages = self.stages.len(), "Pipeline run started");
        let drive = self.drive(initial, &ctx, true).await;
        let elapsed = started.elapsed();

        match &drive.status {
            RunStatus::Succeeded => {
                info!(run_id = %ctx.run_id, pipeline = %self.name, elapsed_ms = elapsed.as_millis() as u64, "Pipeline run succeeded")
            }
            status => {
                warn!(run_id = %ctx.run_id, pipeline = %self.name, status = %status, "Pipeline run stopped early")
            }
        }

        PipelineRun {
            run_id: ctx.run_id,
            pipeline: self.name.clone(),
            status: drive.status,
            state: drive.state,
            timings: drive.timings,
            elapsed,
        }
    }

    /// Stage loop shared by top-level and nested runs. Only a supervised
    /// (top-level) drive races stages against cancellation and the deadline;
    /// dropping it drops the nested stage futures with it.
    pub(crate) fn drive<'a>(
        &'a self,
        mut state: StageState,
        ctx: &'a RunContext,
        supervised: bool,
    ) -> Pin<Box<dyn Future<Output = Drive> + Send + 'a>> {
        Box::pin(async move {
            let mut timings = Vec::with_capacity(self.stages.len());

            if let Some((index, err)) = self.key_graph_violation(state.keys()) {
                warn!(pipeline = %self.name, error = %err, "Key graph check failed before any stage ran");
                let status = RunStatus::FailedAtStage(StageFailure {
                    index,
                    stage: self.stages[index].name().to_string(),
                    error: StageError::Wiring(err),
                });
                return Drive { state, timings, status };
            }

            for (index, stage) in self.stages.iter().enumerate() {
                let descriptor = stage.descriptor();

                if ctx.cancel.is_cancelled() {
                    let status = RunStatus::Cancelled {
                        stage: descriptor.name.clone(),
                        index,
                    };
                    return Drive { state, timings, status };
                }
                if supervised && ctx.is_expired() {
                    let status = RunStatus::TimedOut {
                        stage: descriptor.name.clone(),
                        index,
                        budget: self.budget,
                    };
                    return Drive { state, timings, status };
                }

                debug!(run_id = %ctx.run_id, stage = %descriptor.name, index, "Stage started");
                let stage_started = Instant::now();

                let outcome = {
                    let view = state.view(&descriptor.name, &descriptor.inputs);
                    let call = stage.invoke(view, ctx);
                    if supervised {
                        tokio::select! {
                            biased;
                            _ = ctx.cancel.cancelled() => Interruption::Cancelled,
                            _ = sleep_until(ctx.deadline) => Interruption::DeadlineReached,
                            result = call => Interruption::Finished(result),
                        }
                    } else {
                        Interruption::Finished(call.await)
                    }
                };

                timings.push(StageTiming {
                    stage: descriptor.name.clone(),
                    elapsed: stage_started.elapsed(),
                });

                let result = match outcome {
                    Interruption::Finished(result) => result,
                    Interruption::Cancelled => {
                        info!(run_id = %ctx.run_id, stage = %descriptor.name, "Stage cancelled");
                        let status = RunStatus::Cancelled {
                            stage: descriptor.name.clone(),
                            index,
                        };
                        return Drive { state, timings, status };
                    }
                    Interruption::DeadlineReached => {
                        warn!(run_id = %ctx.run_id, stage = %descriptor.name, "Run budget exhausted mid-stage");
                        let status = RunStatus::TimedOut {
                            stage: descriptor.name.clone(),
                            index,
                            budget: self.budget,
                        };
                        return Drive { state, timings, status };
                    }
                };

                let merged = result.and_then(|outputs| {
                    merge_outputs(&mut state, &descriptor.name, &descriptor.outputs, outputs.into_entries())
                        .map_err(StageError::Wiring)
                });

                if let Err(error) = merged {
                    warn!(
                        run_id = %ctx.run_id,
                        stage = %descriptor.name,
                        code = error.code(),
                        error = %error,
                        "Stage failed"
                    );
                    let status = RunStatus::FailedAtStage(StageFailure {
                        index,
                        stage: descriptor.name.clone(),
                        error,
                    });
                    return Drive { state, timings, status };
                }

                debug!(run_id = %ctx.run_id, stage = %descriptor.name, "Stage finished");
            }

            Drive {
                state,
                timings,
                status: RunStatus::Succeeded,
            }
        })
    }
}

enum Interruption<T> {
    Finished(T),
    Cancelled,
    DeadlineReached,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}

fn merge_outputs(
    state: &mut StageState,
    stage: &str,
    declared: &[StateKey],
    outputs: Vec<(StateKey, crate::pipeline::StateValue)>,
) -> Result<(), PipelineError> {
    // Check everything first so a rejected stage leaves no partial writes
    for (key, _) in &outputs {
        if !declared.contains(key) {
            return Err(PipelineError::UndeclaredOutput {
                stage: stage.to_string(),
                key: key.to_string(),
            });
        }
        if state.contains(key) {
            return Err(PipelineError::DuplicateKey {
                stage: stage.to_string(),
                key: key.to_string(),
            });
        }
    }
    for (key, value) in outputs {
        state.insert(stage, key, value)?;
    }

    if let Some(missing) = declared.iter().find(|key| !state.contains(key)) {
        return Err(PipelineError::MissingOutput {
            stage: stage.to_string(),
            key: missing.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::{PipelineStage, StageDescriptor};
    use crate::pipeline::state::{StageOutputs, StateView};
    use async_trait::async_trait;

    struct Upper {
        descriptor: StageDescriptor,
    }

    #[async_trait]
    impl PipelineStage for Upper {
        fn descriptor(&self) -> &StageDescriptor {
            &self.descriptor
        }

        async fn run(&self, view: StateView<'_>, _ctx: &RunContext) -> Result<StageOutputs, StageError> {
            let input = view.text(&self.descriptor.inputs[0])?;
            Ok(StageOutputs::new().with(self.descriptor.outputs[0].clone(), input.to_uppercase()))
        }
    }

    fn upper(name: &str, input: &str, output: &str) -> Stage {
        Stage::leaf(Upper {
            descriptor: StageDescriptor::leaf(name, [StateKey::new(input)], [StateKey::new(output)]),
        })
    }

    #[test]
    fn test_new_rejects_empty_and_duplicate_writers() {
        let err = SequentialPipeline::new("empty", vec![]).err().unwrap();
        assert_eq!(err.code(), "EmptyPipeline");

        let err = SequentialPipeline::new("dup", vec![upper("a", "x", "y"), upper("b", "x", "y")])
            .err()
            .unwrap();
        assert_eq!(
            err,
            PipelineError::DuplicateKey {
                stage: "b".to_string(),
                key: "y".to_string()
            }
        );
    }

    #[test]
    fn test_new_rejects_read_ahead() {
        let err = SequentialPipeline::new("ahead", vec![upper("a", "z", "y"), upper("b", "y", "z")])
            .err()
            .unwrap();
        assert_eq!(
            err,
            PipelineError::MissingDependency {
                stage: "a".to_string(),
                key: "z".to_string()
            }
        );
    }

    #[test]
    fn test_external_and_produced_keys() {
        let pipeline =
            SequentialPipeline::new("p", vec![upper("a", "x", "y"), upper("b", "y", "z")]).unwrap();
        assert_eq!(pipeline.external_inputs(), vec![StateKey::new("x")]);
        assert_eq!(pipeline.produced_keys(), vec![StateKey::new("y"), StateKey::new("z")]);
        assert!(pipeline.check_key_graph([&StateKey::new("x")]).is_ok());
        assert!(pipeline.check_key_graph([&StateKey::new("y")]).is_err());
    }

    #[tokio::test]
    async fn test_run_threads_state() {
        let pipeline =
            SequentialPipeline::new("p", vec![upper("a", "x", "y"), upper("b", "y", "z")]).unwrap();
        let mut seed = StageState::new();
        seed.insert("input", StateKey::new("x"), "abc").unwrap();

        let run = pipeline.run(seed).await;
        assert!(run.succeeded(), "{}", run.status);
        assert_eq!(run.state.text(&StateKey::new("z")), Some("ABC"));
        assert_eq!(run.timings.len(), 2);
    }

    #[tokio::test]
    async fn test_seed_that_collides_with_an_output_fails_before_running() {
        let pipeline = SequentialPipeline::new("p", vec![upper("a", "x", "y")]).unwrap();
        let mut seed = StageState::new();
        seed.insert("input", StateKey::new("x"), "abc").unwrap();
        seed.insert("input", StateKey::new("y"), "preset").unwrap();

        let run = pipeline.run(seed).await;
        match run.status {
            RunStatus::FailedAtStage(failure) => assert_eq!(failure.error.code(), "DuplicateKey"),
            other => panic!("unexpected status {}", other),
        }
        assert!(run.timings.is_empty());
    }
}
