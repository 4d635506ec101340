//! Trial runner: one candidate from prompt to graded record.
//!
//! Generation is retried boundedly on transient errors. Everything after that
//! (execution, grading) runs exactly once. A trial never returns an error;
//! every failure ends up as a failing criterion in its [`TrialRecord`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{
    CandidateFingerprint, CriterionId, ExecutorOutcome, OutcomeSummary, RubricVerdict, TaskSpec,
    TrialRecord,
};
use crate::executor::Executor;
use crate::generation::{extract_code, CandidateGenerator, GenerationError, GenerationRequest};
use crate::grader::Rubric;
use crate::metrics::METRICS;
use crate::prompt::PromptSpec;

/// Retry policy for generation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first request (0 = request once).
    pub max_retries: u32,
    /// Base delay for exponential backoff (milliseconds).
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Runs single trials against shared generator and executor handles.
#[derive(Clone)]
pub struct TrialRunner {
    generator: Arc<dyn CandidateGenerator>,
    executor: Arc<dyn Executor>,
    retry: RetryPolicy,
}

impl TrialRunner {
    pub fn new(generator: Arc<dyn CandidateGenerator>, executor: Arc<dyn Executor>) -> Self {
        Self {
            generator,
            executor,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Generate, execute and grade candidate `index`.
    pub async fn run_trial(
        &self,
        index: usize,
        task: &TaskSpec,
        rubric: &Rubric,
        prompt: &PromptSpec,
    ) -> TrialRecord {
        let started = Instant::now();
        let timestamp = Utc::now();
        let rendered = prompt.render(task, &task.dataset);

        let (response, attempts) = match self.generate(index, &rendered).await {
            Ok(generated) => generated,
            Err((err, attempts)) => {
                warn!(trial = index, attempts, error = %err, "generation failed");
                return TrialRecord {
                    trial_index: index,
                    timestamp,
                    candidate: None,
                    outcome: OutcomeSummary::generation_failed(err.to_string()),
                    verdict: RubricVerdict::single_failure(
                        CriterionId::GenerationFailed,
                        err.to_string(),
                    ),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    generation_attempts: attempts,
                };
            }
        };

        let source = extract_code(&response);
        let arg = Value::String(task.dataset.clone());
        let executed = self
            .executor
            .execute(&source, &task.entrypoint, task.arity, &arg)
            .await;

        let (outcome, verdict) = match executed {
            Ok(outcome) => {
                if matches!(outcome, ExecutorOutcome::TimedOut { .. }) {
                    METRICS.inc_timeouts();
                }
                let verdict = rubric.grade(&outcome, &source);
                (outcome.summary(), verdict)
            }
            Err(err) => {
                METRICS.inc_internal_errors();
                warn!(trial = index, error = %err, "executor infrastructure failure");
                (
                    OutcomeSummary::internal_error(err.to_string()),
                    RubricVerdict::single_failure(CriterionId::InternalError, err.to_string()),
                )
            }
        };

        TrialRecord {
            trial_index: index,
            timestamp,
            candidate: Some(CandidateFingerprint::of(&source)),
            outcome,
            verdict,
            elapsed_ms: started.elapsed().as_millis() as u64,
            generation_attempts: attempts,
        }
    }

    /// Request a candidate, retrying transient errors. Returns the response
    /// and the number of requests issued.
    async fn generate(
        &self,
        index: usize,
        prompt: &str,
    ) -> Result<(String, u32), (GenerationError, u32)> {
        let request = GenerationRequest {
            trial_index: index,
            prompt,
        };
        let max_attempts = self.retry.max_retries + 1;
        let mut attempt = 1;
        loop {
            match self.generator.generate(&request).await {
                Ok(response) => return Ok((response, attempt)),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    debug!(
                        trial = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying generation"
                    );
                    METRICS.inc_generation_retries();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err((err, attempt)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use crate::executor::{ExecutorError, ExecutorResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const GOOD_SOURCE: &str = "import talib\n\ndef predict_trade(path):\n    rsi = talib.RSI(close)\n";

    /// Fails with the queued errors first, then returns `source`.
    struct ScriptedGenerator {
        failures: Mutex<Vec<GenerationError>>,
        calls: AtomicU32,
        source: String,
    }

    impl ScriptedGenerator {
        fn new(failures: Vec<GenerationError>) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: AtomicU32::new(0),
                source: format!("```python\n{GOOD_SOURCE}```"),
            }
        }
    }

    #[async_trait]
    impl CandidateGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            _request: &GenerationRequest<'_>,
        ) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.failures.lock().unwrap().pop();
            match next {
                Some(err) => Err(err),
                None => Ok(self.source.clone()),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct FixedExecutor(ExecutorResult<ExecutorOutcome>);

    #[async_trait]
    impl Executor for FixedExecutor {
        async fn execute(
            &self,
            _source: &str,
            _entrypoint: &str,
            _arity: usize,
            _arg: &Value,
        ) -> ExecutorResult<ExecutorOutcome> {
            match &self.0 {
                Ok(outcome) => Ok(outcome.clone()),
                Err(_) => Err(ExecutorError::Workspace(std::io::Error::other("disk full"))),
            }
        }
    }

    fn passing_outcome() -> ExecutorOutcome {
        ExecutorOutcome::Returned {
            value: json!({
                "signals": [1, 0, -1],
                "metrics": {
                    "cumulative_returns_final": 0.02,
                    "sharpe_ratio": 1.4,
                    "max_drawdown": 0.1
                }
            }),
        }
    }

    fn runner(generator: Arc<dyn CandidateGenerator>, outcome: ExecutorResult<ExecutorOutcome>) -> TrialRunner {
        TrialRunner::new(generator, Arc::new(FixedExecutor(outcome))).with_retry(RetryPolicy {
            max_retries: 2,
            backoff_base_ms: 100,
        })
    }

    fn rubric() -> Rubric {
        Rubric::from_task(&TaskSpec::default()).unwrap()
    }

    #[tokio::test]
    async fn test_passing_trial() {
        let generator = Arc::new(ScriptedGenerator::new(vec![]));
        let record = runner(generator, Ok(passing_outcome()))
            .run_trial(3, &TaskSpec::default(), &rubric(), &PromptSpec::default())
            .await;
        assert_eq!(record.trial_index, 3);
        assert!(record.passed(), "verdict: {:?}", record.verdict);
        assert_eq!(record.generation_attempts, 1);
        let candidate = record.candidate.unwrap();
        assert_eq!(candidate, CandidateFingerprint::of(GOOD_SOURCE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_generation_errors_are_retried() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            GenerationError::RateLimited,
            GenerationError::Transport("reset".into()),
        ]));
        let record = runner(generator.clone(), Ok(passing_outcome()))
            .run_trial(0, &TaskSpec::default(), &rubric(), &PromptSpec::default())
            .await;
        assert!(record.passed());
        assert_eq!(record.generation_attempts, 3);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_record_generation_failure() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            GenerationError::RateLimited,
            GenerationError::RateLimited,
            GenerationError::RateLimited,
        ]));
        let record = runner(generator, Ok(passing_outcome()))
            .run_trial(1, &TaskSpec::default(), &rubric(), &PromptSpec::default())
            .await;
        assert!(!record.passed());
        assert!(record.candidate.is_none());
        assert_eq!(record.generation_attempts, 3);
        assert_eq!(record.outcome.status, "generation_failed");
        assert_eq!(
            record.verdict.first_failure().unwrap().criterion,
            CriterionId::GenerationFailed
        );
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_fast() {
        let generator = Arc::new(ScriptedGenerator::new(vec![GenerationError::Provider {
            status: 401,
            message: "invalid key".into(),
        }]));
        let record = runner(generator.clone(), Ok(passing_outcome()))
            .run_trial(0, &TaskSpec::default(), &rubric(), &PromptSpec::default())
            .await;
        assert_eq!(record.generation_attempts, 1);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert!(record.verdict.reason().unwrap().contains("invalid key"));
    }

    #[tokio::test]
    async fn test_runtime_error_recorded() {
        let generator = Arc::new(ScriptedGenerator::new(vec![]));
        let outcome = ExecutorOutcome::RaisedError {
            kind: ErrorKind::DivisionByZero,
            message: "division by zero".into(),
        };
        let record = runner(generator, Ok(outcome))
            .run_trial(0, &TaskSpec::default(), &rubric(), &PromptSpec::default())
            .await;
        assert!(!record.passed());
        assert_eq!(record.verdict.criteria.len(), 1);
        assert_eq!(
            record.verdict.first_failure().unwrap().criterion,
            CriterionId::RuntimeError
        );
        assert!(record.candidate.is_some());
    }

    #[tokio::test]
    async fn test_executor_failure_is_internal_error() {
        let generator = Arc::new(ScriptedGenerator::new(vec![]));
        let record = runner(
            generator,
            Err(ExecutorError::InvalidConfig("unused".into())),
        )
        .run_trial(0, &TaskSpec::default(), &rubric(), &PromptSpec::default())
        .await;
        assert_eq!(record.outcome.status, "internal_error");
        assert_eq!(
            record.verdict.first_failure().unwrap().criterion,
            CriterionId::InternalError
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 250,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1000));
    }
}
