//! Trial batch orchestrator.
//!
//! Runs `n` independent trials under a [`ConcurrencyPolicy`], turns anything
//! that escapes a trial into a failing record, and aggregates the ordered
//! records into a [`BatchResult`].
//!
//! Cancellation is cooperative: once the watch flag flips to `true` no new
//! trial is dispatched, trials already running finish, and the batch returns
//! [`BatchError::Cancelled`] instead of a result.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{
    BatchResult, CriterionId, OutcomeSummary, RubricVerdict, TargetInterval, TaskSpec,
    TrialRecord,
};
use crate::grader::Rubric;
use crate::metrics::METRICS;
use crate::obs::{self, BatchSpan};
use crate::prompt::PromptSpec;
use crate::recorder::ResultsRecorder;
use crate::trial::TrialRunner;

/// How many trials may be in flight at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    Sequential,
    BoundedParallel { max_in_flight: usize },
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self::BoundedParallel { max_in_flight: 4 }
    }
}

impl ConcurrencyPolicy {
    pub fn max_in_flight(&self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::BoundedParallel { max_in_flight } => *max_in_flight,
        }
    }
}

/// Errors that stop a batch from producing a result.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch cancelled after {completed} completed trial(s)")]
    Cancelled { completed: usize },

    #[error("invalid batch configuration: {0}")]
    Configuration(String),
}

/// A finished batch: the aggregate plus every record in `trial_index` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub result: BatchResult,
    pub trials: Vec<TrialRecord>,
}

impl BatchReport {
    /// Failure reasons (`"<criterion>: <detail>"`) with counts, most frequent
    /// first.
    pub fn failure_reasons(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for reason in self.trials.iter().filter_map(|t| t.verdict.reason()) {
            *counts.entry(reason).or_insert(0) += 1;
        }
        let mut reasons: Vec<(String, usize)> = counts.into_iter().collect();
        reasons.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        reasons
    }
}

/// Dispatches trials and aggregates their records.
#[derive(Clone)]
pub struct BatchOrchestrator {
    runner: TrialRunner,
    target: TargetInterval,
    recorder: Option<Arc<ResultsRecorder>>,
}

impl BatchOrchestrator {
    pub fn new(runner: TrialRunner, target: TargetInterval) -> Self {
        Self {
            runner,
            target,
            recorder: None,
        }
    }

    /// Append every completed batch to `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<ResultsRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn target(&self) -> TargetInterval {
        self.target
    }

    /// Run `n` trials of `task` and aggregate them.
    pub async fn run_batch(
        &self,
        n: usize,
        task: Arc<TaskSpec>,
        prompt: &PromptSpec,
        policy: ConcurrencyPolicy,
        cancel: watch::Receiver<bool>,
    ) -> Result<BatchReport, BatchError> {
        if n == 0 {
            return Err(BatchError::Configuration(
                "trial count must be greater than zero".to_string(),
            ));
        }
        let max_in_flight = policy.max_in_flight();
        if max_in_flight == 0 {
            return Err(BatchError::Configuration(
                "max_in_flight must be greater than zero".to_string(),
            ));
        }
        self.target
            .validate()
            .map_err(|e| BatchError::Configuration(e.to_string()))?;
        task.validate()
            .map_err(|e| BatchError::Configuration(e.to_string()))?;
        let rubric = Rubric::from_task(&task)
            .map(Arc::new)
            .map_err(|e| BatchError::Configuration(e.to_string()))?;

        let run_id = Uuid::new_v4();
        let run_timestamp = Utc::now();
        let started = Instant::now();
        let span = BatchSpan::new(&run_id, &task.dataset);
        obs::emit_batch_started(&run_id, n, max_in_flight);

        let dispatch = self.dispatch(
            n,
            Arc::clone(&task),
            rubric,
            Arc::new(prompt.clone()),
            max_in_flight,
            cancel,
        );
        let (trials, cancelled) = span.instrument(dispatch).await;

        if cancelled {
            warn!(run_id = %run_id, completed = trials.len(), "batch cancelled");
            return Err(BatchError::Cancelled {
                completed: trials.len(),
            });
        }

        let result = BatchResult::aggregate(
            run_id,
            run_timestamp,
            task.dataset.clone(),
            n,
            self.target,
            &trials,
        );
        obs::emit_batch_finished(&result, started.elapsed().as_millis() as u64);
        METRICS.flush();

        let report = BatchReport { result, trials };
        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.record(&report).await {
                obs::emit_recorder_append_failed(&run_id, &e);
            }
        }
        Ok(report)
    }

    /// Dispatch trials until done or cancelled. Returns completed records in
    /// index order and whether cancellation stopped dispatch early.
    async fn dispatch(
        &self,
        n: usize,
        task: Arc<TaskSpec>,
        rubric: Arc<Rubric>,
        prompt: Arc<PromptSpec>,
        max_in_flight: usize,
        cancel: watch::Receiver<bool>,
    ) -> (Vec<TrialRecord>, bool) {
        let sem = Arc::new(Semaphore::new(max_in_flight));
        let mut join_set = JoinSet::new();
        let mut cancelled = false;
        let mut dispatched = 0;

        for index in 0..n {
            let Ok(permit) = Arc::clone(&sem).acquire_owned().await else {
                break;
            };
            // Checked after the permit so a flag raised while waiting stops
            // this dispatch too.
            if *cancel.borrow() {
                cancelled = true;
                break;
            }

            let runner = self.runner.clone();
            let task = Arc::clone(&task);
            let rubric = Arc::clone(&rubric);
            let prompt = Arc::clone(&prompt);
            join_set.spawn(async move {
                let _permit = permit;
                let outcome = AssertUnwindSafe(runner.run_trial(index, &task, &rubric, &prompt))
                    .catch_unwind()
                    .await;
                let record = match outcome {
                    Ok(record) => record,
                    Err(payload) => internal_error_record(
                        index,
                        format!("trial panicked: {}", panic_message(payload.as_ref())),
                    ),
                };
                (index, record)
            });
            dispatched += 1;
        }

        let mut slots: Vec<Option<TrialRecord>> = vec![None; dispatched];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, record)) => {
                    obs::emit_trial_finished(&record);
                    METRICS.inc_trials(record.passed());
                    slots[index] = Some(record);
                }
                Err(e) => warn!(error = %e, "trial task failed to join"),
            }
        }

        let records = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    METRICS.inc_trials(false);
                    internal_error_record(index, "trial task did not complete".to_string())
                })
            })
            .collect::<Vec<_>>();
        debug!(dispatched, cancelled, "dispatch finished");
        (records, cancelled)
    }
}

fn internal_error_record(index: usize, detail: String) -> TrialRecord {
    METRICS.inc_internal_errors();
    TrialRecord {
        trial_index: index,
        timestamp: Utc::now(),
        candidate: None,
        outcome: OutcomeSummary::internal_error(detail.clone()),
        verdict: RubricVerdict::single_failure(CriterionId::InternalError, detail),
        elapsed_ms: 0,
        generation_attempts: 0,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Batch source seam
// ---------------------------------------------------------------------------

/// Something that can run one batch for a task and prompt. The tuner drives
/// this instead of the orchestrator directly.
#[async_trait]
pub trait BatchSource: Send + Sync {
    async fn run_batch(
        &self,
        task: Arc<TaskSpec>,
        prompt: &PromptSpec,
    ) -> Result<BatchReport, BatchError>;
}

/// An orchestrator bound to a trial count, policy and cancel signal.
pub struct BatchPlan {
    pub orchestrator: BatchOrchestrator,
    pub trials: usize,
    pub policy: ConcurrencyPolicy,
    pub cancel: watch::Receiver<bool>,
}

#[async_trait]
impl BatchSource for BatchPlan {
    async fn run_batch(
        &self,
        task: Arc<TaskSpec>,
        prompt: &PromptSpec,
    ) -> Result<BatchReport, BatchError> {
        self.orchestrator
            .run_batch(self.trials, task, prompt, self.policy, self.cancel.clone())
            .await
    }
}
