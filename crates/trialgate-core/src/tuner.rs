//! Difficulty tuner.
//!
//! Bounded fixed-step search over threshold values:
//!
//! ```text
//! Idle -> RunningBatch -> Converged
//!                      -> Adjusting -> RunningBatch
//!                                   -> ExhaustedBudget
//! ```
//!
//! Each batch is one noisy sample of the pass rate. There is no smoothing, so
//! the search can oscillate around the target; only `max_attempts` bounds it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::batch::{BatchError, BatchSource};
use crate::domain::{EngineError, MetricThreshold, RateStatus, Result, TargetInterval, TaskSpec};
use crate::obs;
use crate::prompt::PromptSpec;

/// Where the tuner is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunerState {
    Idle,
    RunningBatch,
    Adjusting,
    Converged,
    ExhaustedBudget,
}

impl TunerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RunningBatch => "running_batch",
            Self::Adjusting => "adjusting",
            Self::Converged => "converged",
            Self::ExhaustedBudget => "exhausted_budget",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::ExhaustedBudget)
    }
}

impl fmt::Display for TunerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way to move thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Make the task easier (pass rate too low).
    Relax,
    /// Make the task harder (pass rate too high).
    Tighten,
}

/// `[tuner]` section of the engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub max_attempts: u32,
    pub target_min: f64,
    pub target_max: f64,
    /// Step for thresholds without an entry in `steps`.
    pub default_step: f64,
    /// Per-metric step sizes.
    pub steps: BTreeMap<String, f64>,
    /// Attach failure guidance to the prompt when the pass rate is too low.
    pub adjust_prompt: bool,
}

impl Default for TunerConfig {
    fn default() -> Self {
        let target = TargetInterval::default();
        Self {
            max_attempts: 10,
            target_min: target.min,
            target_max: target.max,
            default_step: 0.1,
            steps: BTreeMap::new(),
            adjust_prompt: true,
        }
    }
}

impl TunerConfig {
    pub fn target(&self) -> TargetInterval {
        TargetInterval {
            min: self.target_min,
            max: self.target_max,
        }
    }

    pub fn step_for(&self, metric: &str) -> f64 {
        self.steps.get(metric).copied().unwrap_or(self.default_step)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::config("tuner.max_attempts must be at least 1"));
        }
        self.target().validate()?;
        let steps = std::iter::once(("default_step", self.default_step))
            .chain(self.steps.iter().map(|(k, v)| (k.as_str(), *v)));
        for (name, step) in steps {
            if !step.is_finite() || step <= 0.0 {
                return Err(EngineError::config(format!(
                    "tuner step for '{name}' must be a positive number, got {step}"
                )));
            }
        }
        Ok(())
    }
}

/// Move every threshold one step in `direction`.
///
/// Relaxing lowers `>=`/`>` bounds and raises `<=`/`<` bounds; tightening does
/// the reverse.
pub fn adjust_thresholds(
    thresholds: &[MetricThreshold],
    direction: Direction,
    config: &TunerConfig,
) -> Vec<MetricThreshold> {
    thresholds
        .iter()
        .map(|t| {
            let step = config.step_for(&t.metric);
            let easier = if t.op.is_lower_bound() { -step } else { step };
            let delta = match direction {
                Direction::Relax => easier,
                Direction::Tighten => -easier,
            };
            MetricThreshold {
                value: t.value + delta,
                ..t.clone()
            }
        })
        .collect()
}

/// One batch as seen by the tuner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunerAttempt {
    pub attempt: u32,
    pub run_id: Uuid,
    pub pass_rate: f64,
    pub status: RateStatus,
    /// Thresholds the batch ran with.
    pub thresholds: Vec<MetricThreshold>,
    pub failure_modes: BTreeMap<String, usize>,
}

/// Final tuner result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunerOutcome {
    pub state: TunerState,
    pub attempts: u32,
    pub last_pass_rate: Option<f64>,
    /// Thresholds after the last adjustment (the converged ones on success).
    pub thresholds: Vec<MetricThreshold>,
    pub prompt: PromptSpec,
    pub history: Vec<TunerAttempt>,
}

impl TunerOutcome {
    pub fn converged(&self) -> bool {
        self.state == TunerState::Converged
    }
}

/// Drives batches until the pass rate lands in the target interval.
#[derive(Debug, Clone)]
pub struct DifficultyTuner {
    config: TunerConfig,
}

impl DifficultyTuner {
    pub fn new(config: TunerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    /// Run the search starting from `task` and `prompt`.
    ///
    /// Batch errors (cancellation, configuration) end the search and are
    /// returned as-is.
    pub async fn run(
        &self,
        source: &dyn BatchSource,
        mut task: TaskSpec,
        mut prompt: PromptSpec,
    ) -> std::result::Result<TunerOutcome, BatchError> {
        let target = self.config.target();
        let mut state = TunerState::Idle;
        let mut history = Vec::new();
        let mut attempt: u32 = 0;
        let mut last_pass_rate = None;

        loop {
            state = transition(attempt + 1, state, TunerState::RunningBatch, last_pass_rate);
            attempt += 1;

            let report = source.run_batch(Arc::new(task.clone()), &prompt).await?;
            let pass_rate = report.result.pass_rate;
            let status = target.classify(pass_rate);
            last_pass_rate = Some(pass_rate);
            history.push(TunerAttempt {
                attempt,
                run_id: report.result.run_id,
                pass_rate,
                status,
                thresholds: task.thresholds.clone(),
                failure_modes: report.result.failure_modes.clone(),
            });
            info!(
                attempt,
                pass_rate,
                status = %status,
                target = %target,
                "tuner observed batch"
            );

            let direction = match status {
                RateStatus::InRange => {
                    state = transition(attempt, state, TunerState::Converged, last_pass_rate);
                    break;
                }
                RateStatus::TooLow => Direction::Relax,
                RateStatus::TooHigh => Direction::Tighten,
            };

            state = transition(attempt, state, TunerState::Adjusting, last_pass_rate);
            if attempt >= self.config.max_attempts {
                state = transition(attempt, state, TunerState::ExhaustedBudget, last_pass_rate);
                break;
            }

            task.thresholds = adjust_thresholds(&task.thresholds, direction, &self.config);
            if self.config.adjust_prompt {
                prompt = match direction {
                    Direction::Relax => prompt.with_guidance(attempt, &report.failure_reasons()),
                    Direction::Tighten => prompt.with_guidance(attempt, &[]),
                };
            }
        }

        Ok(TunerOutcome {
            state,
            attempts: attempt,
            last_pass_rate,
            thresholds: task.thresholds,
            prompt,
            history,
        })
    }
}

fn transition(
    attempt: u32,
    from: TunerState,
    to: TunerState,
    pass_rate: Option<f64>,
) -> TunerState {
    obs::emit_tuner_transition(attempt, from.as_str(), to.as_str(), pass_rate);
    to
}
