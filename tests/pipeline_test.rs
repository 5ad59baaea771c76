use async_trait::async_trait;
use bi_agent::pipeline::{
    PipelineError, PipelineStage, RunContext, RunStatus, SequentialPipeline, Stage, StageDescriptor, StageError,
    StageOutputs, StageState, StateKey, StateView,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Copies its single input (or a constant) to its single output and counts calls
struct CopyStage {
    descriptor: StageDescriptor,
    calls: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
}

impl CopyStage {
    fn new(name: &str, inputs: &[&str], output: &str, calls: &Arc<AtomicUsize>) -> Self {
        Self {
            descriptor: StageDescriptor::leaf(
                name,
                inputs.iter().map(|k| StateKey::new(*k)),
                [StateKey::new(output)],
            ),
            calls: Arc::clone(calls),
            delay: Duration::ZERO,
            fail: false,
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl PipelineStage for CopyStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn run(&self, view: StateView<'_>, _ctx: &RunContext) -> Result<StageOutputs, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(StageError::malformed("generator emitted prose"));
        }
        let value = match self.descriptor.inputs.first() {
            Some(key) => format!("{}+{}", view.text(key)?, self.descriptor.name),
            None => self.descriptor.name.clone(),
        };
        Ok(StageOutputs::new().with(self.descriptor.outputs[0].clone(), value))
    }
}

/// Writes a key it never declared
struct RogueStage {
    descriptor: StageDescriptor,
}

#[async_trait]
impl PipelineStage for RogueStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn run(&self, _view: StateView<'_>, _ctx: &RunContext) -> Result<StageOutputs, StageError> {
        Ok(StageOutputs::new()
            .with(StateKey::new("declared"), "ok")
            .with(StateKey::new("question"), "overwritten"))
    }
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[tokio::test]
async fn test_missing_input_fails_before_first_stage_runs() {
    let (c1, c2, c3) = (counter(), counter(), counter());
    let pipeline = SequentialPipeline::new(
        "chain",
        vec![
            Stage::leaf(CopyStage::new("s1", &[], "a", &c1)),
            Stage::leaf(CopyStage::new("s2", &["never_written"], "b", &c2)),
            Stage::leaf(CopyStage::new("s3", &["b"], "c", &c3)),
        ],
    )
    .unwrap();

    let run = pipeline.run(StageState::new()).await;

    match &run.status {
        RunStatus::FailedAtStage(failure) => {
            assert_eq!(failure.stage, "s2");
            assert_eq!(failure.index, 1);
            assert_eq!(failure.error.code(), "MissingDependency");
        }
        other => panic!("expected failed-at-stage, got {}", other),
    }
    assert_eq!(c1.load(Ordering::SeqCst), 0);
    assert_eq!(c2.load(Ordering::SeqCst), 0);
    assert_eq!(c3.load(Ordering::SeqCst), 0);
    assert!(run.state.is_empty());
}

#[tokio::test]
async fn test_static_check_names_missing_key() {
    let c = counter();
    let pipeline = SequentialPipeline::new(
        "chain",
        vec![
            Stage::leaf(CopyStage::new("s1", &["question"], "a", &c)),
            Stage::leaf(CopyStage::new("s2", &["a", "context"], "b", &c)),
        ],
    )
    .unwrap();

    let err = pipeline.check_key_graph(&[StateKey::new("question")]).unwrap_err();
    assert_eq!(
        err,
        PipelineError::MissingDependency {
            stage: "s2".to_string(),
            key: "context".to_string()
        }
    );
    assert!(pipeline
        .check_key_graph(&[StateKey::new("question"), StateKey::new("context")])
        .is_ok());
}

#[tokio::test]
async fn test_stages_run_in_order_and_state_is_write_once() {
    let c = counter();
    let pipeline = SequentialPipeline::new(
        "chain",
        vec![
            Stage::leaf(CopyStage::new("s1", &["question"], "a", &c)),
            Stage::leaf(CopyStage::new("s2", &["a"], "b", &c)),
        ],
    )
    .unwrap();

    let mut seed = StageState::new();
    seed.insert("input", StateKey::new("question"), "q").unwrap();
    let run = pipeline.run(seed).await;

    assert!(run.succeeded());
    assert_eq!(run.state.text(&StateKey::new("b")), Some("q+s1+s2"));
    let order: Vec<&str> = run.state.keys().map(|k| k.as_str()).collect();
    assert_eq!(order, vec!["question", "a", "b"]);
    assert_eq!(run.timings.len(), 2);
}

#[tokio::test]
async fn test_undeclared_output_fails_the_stage() {
    let pipeline = SequentialPipeline::new(
        "chain",
        vec![Stage::leaf(RogueStage {
            descriptor: StageDescriptor::leaf("rogue", [StateKey::new("question")], [StateKey::new("declared")]),
        })],
    )
    .unwrap();

    let mut seed = StageState::new();
    seed.insert("input", StateKey::new("question"), "original").unwrap();
    let run = pipeline.run(seed).await;

    match &run.status {
        RunStatus::FailedAtStage(failure) => assert_eq!(failure.error.code(), "UndeclaredOutput"),
        other => panic!("expected failed-at-stage, got {}", other),
    }
    assert_eq!(run.state.text(&StateKey::new("question")), Some("original"));
}

#[tokio::test]
async fn test_nested_failure_aborts_outer_pipeline() {
    let (outer_calls, inner_calls, after_calls) = (counter(), counter(), counter());
    let inner = SequentialPipeline::new(
        "insight_pipeline",
        vec![
            Stage::leaf(CopyStage::new("visualization", &["a"], "chart", &inner_calls)),
            Stage::leaf(CopyStage::new("explanation", &["chart"], "text", &inner_calls).failing()),
        ],
    )
    .unwrap();
    let pipeline = SequentialPipeline::new(
        "outer",
        vec![
            Stage::leaf(CopyStage::new("s1", &[], "a", &outer_calls)),
            Stage::nested(inner),
            Stage::leaf(CopyStage::new("after", &["text"], "done", &after_calls)),
        ],
    )
    .unwrap();

    let run = pipeline.run(StageState::new()).await;

    match &run.status {
        RunStatus::FailedAtStage(failure) => {
            assert_eq!(failure.stage, "insight_pipeline");
            assert_eq!(failure.stage_path(), vec!["insight_pipeline", "explanation"]);
            assert_eq!(failure.root_error().code(), "MalformedGeneration");
        }
        other => panic!("expected failed-at-stage, got {}", other),
    }
    assert_eq!(inner_calls.load(Ordering::SeqCst), 2);
    assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    // Nothing from the failed nested run leaks into outer state
    let keys: Vec<&str> = run.state.keys().map(|k| k.as_str()).collect();
    assert_eq!(keys, vec!["a"]);
}

#[tokio::test]
async fn test_nested_success_merges_inner_outputs() {
    let c = counter();
    let inner = SequentialPipeline::new(
        "insight_pipeline",
        vec![
            Stage::leaf(CopyStage::new("visualization", &["a"], "chart", &c)),
            Stage::leaf(CopyStage::new("explanation", &["chart"], "text", &c)),
        ],
    )
    .unwrap();
    let nested = Stage::nested(inner);
    assert_eq!(nested.descriptor().inputs, vec![StateKey::new("a")]);
    assert_eq!(nested.descriptor().outputs, vec![StateKey::new("chart"), StateKey::new("text")]);

    let pipeline =
        SequentialPipeline::new("outer", vec![Stage::leaf(CopyStage::new("s1", &[], "a", &c)), nested]).unwrap();
    let run = pipeline.run(StageState::new()).await;

    assert!(run.succeeded());
    assert_eq!(run.state.text(&StateKey::new("text")), Some("s1+visualization+explanation"));
}

#[tokio::test]
async fn test_cancellation_stops_in_flight_stage() {
    let (c1, c2) = (counter(), counter());
    let pipeline = SequentialPipeline::new(
        "chain",
        vec![
            Stage::leaf(CopyStage::new("slow", &[], "a", &c1).slow(Duration::from_secs(30))),
            Stage::leaf(CopyStage::new("next", &["a"], "b", &c2)),
        ],
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let run = pipeline
        .run_with(StageState::new(), RunContext::new().with_cancel(cancel))
        .await;

    assert!(matches!(run.status, RunStatus::Cancelled { ref stage, .. } if stage == "slow"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(c2.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_budget_expiry_reports_timed_out() {
    let c = counter();
    let pipeline = SequentialPipeline::new(
        "chain",
        vec![Stage::leaf(CopyStage::new("slow", &[], "a", &c).slow(Duration::from_secs(30)))],
    )
    .unwrap()
    .with_budget(Some(Duration::from_millis(100)));

    let started = Instant::now();
    let run = pipeline.run(StageState::new()).await;

    assert!(matches!(run.status, RunStatus::TimedOut { ref stage, .. } if stage == "slow"));
    assert_eq!(run.status.to_string(), "timed-out(slow)");
    assert!(started.elapsed() < Duration::from_secs(5));
}
