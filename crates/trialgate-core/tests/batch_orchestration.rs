//! Batch orchestration: ordering, aggregation, isolation and cancellation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use trialgate_core::executor::ExecutorResult;
use trialgate_core::recorder::TRIAL_LOG;
use trialgate_core::{
    BatchError, BatchOrchestrator, CandidateGenerator, ConcurrencyPolicy, CriterionId, ErrorKind,
    Executor, ExecutorOutcome, GenerationError, GenerationRequest, PromptSpec, ResultsRecorder,
    TargetInterval, TaskSpec, TrialRunner,
};

/// Emits a source whose first line names the trial index.
struct IndexedGenerator;

#[async_trait]
impl CandidateGenerator for IndexedGenerator {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationError> {
        Ok(format!(
            "# trial {}\nimport talib\n\ndef predict_trade(path):\n    return talib.RSI(path)\n",
            request.trial_index
        ))
    }

    fn name(&self) -> &str {
        "indexed"
    }
}

fn trial_index(source: &str) -> usize {
    source
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("# trial "))
        .and_then(|n| n.trim().parse().ok())
        .unwrap_or_else(|| panic!("source without trial header: {source}"))
}

fn passing_value() -> Value {
    json!({
        "signals": [1, 0, -1, "buy"],
        "metrics": {
            "cumulative_returns_final": 0.03,
            "sharpe_ratio": 1.2,
            "max_drawdown": 0.05
        }
    })
}

/// Passes the trials in `passing`, raises for the rest. Earlier trials sleep
/// longer so completion order is reversed under parallelism.
struct PatternExecutor {
    passing: HashSet<usize>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl PatternExecutor {
    fn new(pattern: &[bool]) -> Self {
        Self {
            passing: pattern
                .iter()
                .enumerate()
                .filter(|(_, p)| **p)
                .map(|(i, _)| i)
                .collect(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Executor for PatternExecutor {
    async fn execute(
        &self,
        source: &str,
        _entrypoint: &str,
        _arity: usize,
        _arg: &Value,
    ) -> ExecutorResult<ExecutorOutcome> {
        let index = trial_index(source);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30u64.saturating_sub(index as u64 * 5))).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.passing.contains(&index) {
            Ok(ExecutorOutcome::Returned {
                value: passing_value(),
            })
        } else {
            Ok(ExecutorOutcome::RaisedError {
                kind: ErrorKind::DivisionByZero,
                message: "division by zero".to_string(),
            })
        }
    }
}

fn orchestrator(executor: Arc<dyn Executor>) -> BatchOrchestrator {
    let runner = TrialRunner::new(Arc::new(IndexedGenerator), executor);
    BatchOrchestrator::new(runner, TargetInterval::default())
}

fn no_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

const PATTERN: [bool; 5] = [true, false, true, true, false];

#[tokio::test]
async fn test_pattern_aggregates_in_index_order() {
    let executor = Arc::new(PatternExecutor::new(&PATTERN));
    let report = orchestrator(executor)
        .run_batch(
            5,
            Arc::new(TaskSpec::default()),
            &PromptSpec::default(),
            ConcurrencyPolicy::BoundedParallel { max_in_flight: 5 },
            no_cancel(),
        )
        .await
        .unwrap();

    assert_eq!(report.result.trial_count, 5);
    assert_eq!(report.result.pass_count, 3);
    assert!((report.result.pass_rate - 0.6).abs() < 1e-12);
    let indices: Vec<usize> = report.trials.iter().map(|t| t.trial_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    let passed: Vec<bool> = report.trials.iter().map(|t| t.passed()).collect();
    assert_eq!(passed, PATTERN.to_vec());
    assert_eq!(report.result.failure_modes.get("runtime_error"), Some(&2));
}

#[tokio::test]
async fn test_parallel_matches_sequential() {
    let sequential = orchestrator(Arc::new(PatternExecutor::new(&PATTERN)))
        .run_batch(
            5,
            Arc::new(TaskSpec::default()),
            &PromptSpec::default(),
            ConcurrencyPolicy::Sequential,
            no_cancel(),
        )
        .await
        .unwrap();

    let executor = Arc::new(PatternExecutor::new(&PATTERN));
    let parallel = orchestrator(executor.clone())
        .run_batch(
            5,
            Arc::new(TaskSpec::default()),
            &PromptSpec::default(),
            ConcurrencyPolicy::BoundedParallel { max_in_flight: 2 },
            no_cancel(),
        )
        .await
        .unwrap();

    assert_eq!(sequential.result.pass_count, parallel.result.pass_count);
    assert!(executor.peak.load(Ordering::SeqCst) <= 2);
    let seq_passed: Vec<bool> = sequential.trials.iter().map(|t| t.passed()).collect();
    let par_passed: Vec<bool> = parallel.trials.iter().map(|t| t.passed()).collect();
    assert_eq!(seq_passed, par_passed);
}

#[tokio::test]
async fn test_sequential_runs_one_at_a_time() {
    let executor = Arc::new(PatternExecutor::new(&PATTERN));
    orchestrator(executor.clone())
        .run_batch(
            4,
            Arc::new(TaskSpec::default()),
            &PromptSpec::default(),
            ConcurrencyPolicy::Sequential,
            no_cancel(),
        )
        .await
        .unwrap();
    assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
}

/// Panics on odd trials.
struct PanickyExecutor;

#[async_trait]
impl Executor for PanickyExecutor {
    async fn execute(
        &self,
        source: &str,
        _entrypoint: &str,
        _arity: usize,
        _arg: &Value,
    ) -> ExecutorResult<ExecutorOutcome> {
        if trial_index(source) % 2 == 1 {
            panic!("executor exploded");
        }
        Ok(ExecutorOutcome::Returned {
            value: passing_value(),
        })
    }
}

#[tokio::test]
async fn test_panicking_trial_becomes_internal_error() {
    let report = orchestrator(Arc::new(PanickyExecutor))
        .run_batch(
            4,
            Arc::new(TaskSpec::default()),
            &PromptSpec::default(),
            ConcurrencyPolicy::BoundedParallel { max_in_flight: 2 },
            no_cancel(),
        )
        .await
        .unwrap();

    assert_eq!(report.trials.len(), 4);
    assert_eq!(report.result.pass_count, 2);
    let failed = &report.trials[1];
    let failure = failed.verdict.first_failure().unwrap();
    assert_eq!(failure.criterion, CriterionId::InternalError);
    assert!(failure.detail.contains("executor exploded"));
}

#[tokio::test]
async fn test_zero_trials_is_configuration_error() {
    let err = orchestrator(Arc::new(PanickyExecutor))
        .run_batch(
            0,
            Arc::new(TaskSpec::default()),
            &PromptSpec::default(),
            ConcurrencyPolicy::Sequential,
            no_cancel(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::Configuration(_)));
}

#[tokio::test]
async fn test_invalid_task_rejected_before_trials() {
    let executor = Arc::new(PatternExecutor::new(&PATTERN));
    let task = TaskSpec {
        entrypoint: String::new(),
        ..Default::default()
    };
    let err = orchestrator(executor.clone())
        .run_batch(
            3,
            Arc::new(task),
            &PromptSpec::default(),
            ConcurrencyPolicy::Sequential,
            no_cancel(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::Configuration(_)));
    assert_eq!(executor.peak.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let err = orchestrator(Arc::new(PatternExecutor::new(&PATTERN)))
        .run_batch(
            5,
            Arc::new(TaskSpec::default()),
            &PromptSpec::default(),
            ConcurrencyPolicy::Sequential,
            rx,
        )
        .await
        .unwrap_err();
    match err {
        BatchError::Cancelled { completed } => assert_eq!(completed, 0),
        other => panic!("expected Cancelled, got {:?}", other),
    }
}

/// Raises the cancel flag while running trial 1.
struct CancellingExecutor {
    cancel: watch::Sender<bool>,
}

#[async_trait]
impl Executor for CancellingExecutor {
    async fn execute(
        &self,
        source: &str,
        _entrypoint: &str,
        _arity: usize,
        _arg: &Value,
    ) -> ExecutorResult<ExecutorOutcome> {
        if trial_index(source) == 1 {
            self.cancel.send_replace(true);
        }
        Ok(ExecutorOutcome::Returned {
            value: passing_value(),
        })
    }
}

#[tokio::test]
async fn test_cancel_mid_batch_finishes_running_trials_only() {
    let (tx, rx) = watch::channel(false);
    let executor = Arc::new(CancellingExecutor { cancel: tx });
    let err = orchestrator(executor)
        .run_batch(
            5,
            Arc::new(TaskSpec::default()),
            &PromptSpec::default(),
            ConcurrencyPolicy::Sequential,
            rx,
        )
        .await
        .unwrap_err();
    match err {
        BatchError::Cancelled { completed } => assert_eq!(completed, 2),
        other => panic!("expected Cancelled, got {:?}", other),
    }
}

#[tokio::test]
async fn test_recorder_receives_completed_batch() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(ResultsRecorder::open(dir.path()).await.unwrap());
    let report = orchestrator(Arc::new(PatternExecutor::new(&PATTERN)))
        .with_recorder(Arc::clone(&recorder))
        .run_batch(
            5,
            Arc::new(TaskSpec::default()),
            &PromptSpec::default(),
            ConcurrencyPolicy::BoundedParallel { max_in_flight: 3 },
            no_cancel(),
        )
        .await
        .unwrap();

    let history = recorder.history().await.unwrap();
    assert_eq!(history.len(), 5);
    assert!(history.iter().all(|e| e.run_id == report.result.run_id));
    let indices: Vec<usize> = history.iter().map(|e| e.record.trial_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);

    let summaries = recorder.summaries().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].contains("passed=3"));
    assert!(summaries[0].contains("pass_rate=60.0%"));
    assert!(summaries[0].ends_with("status=TOO_HIGH"));
}

#[tokio::test]
async fn test_recorder_failure_still_returns_report() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(ResultsRecorder::open(dir.path()).await.unwrap());
    // A directory where the trial log should be makes every append fail.
    std::fs::create_dir(dir.path().join(TRIAL_LOG)).unwrap();

    let report = orchestrator(Arc::new(PatternExecutor::new(&PATTERN)))
        .with_recorder(Arc::clone(&recorder))
        .run_batch(
            5,
            Arc::new(TaskSpec::default()),
            &PromptSpec::default(),
            ConcurrencyPolicy::BoundedParallel { max_in_flight: 2 },
            no_cancel(),
        )
        .await
        .unwrap();

    assert_eq!(report.result.pass_count, 3);
    assert_eq!(report.trials.len(), 5);
    assert!(recorder.history().await.is_err());
}
