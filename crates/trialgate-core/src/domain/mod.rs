//! Domain models for trialgate.
//!
//! Canonical definitions for the core entities:
//! - `TaskSpec`: immutable rubric/task configuration
//! - `ExecutorOutcome`: what happened when a candidate ran
//! - `RubricVerdict`: ordered criterion evaluations
//! - `TrialRecord` / `BatchResult`: per-trial and aggregate results

pub mod error;
pub mod outcome;
pub mod task;
pub mod trial;
pub mod verdict;

pub use error::{EngineError, Result};
pub use outcome::{ErrorKind, ExecutorOutcome, OutcomeSummary};
pub use task::{CapabilityRequirement, Comparison, MetricThreshold, TaskSpec, METRICS_KEY, SIGNALS_KEY};
pub use trial::{BatchResult, CandidateFingerprint, RateStatus, TargetInterval, TrialRecord};
pub use verdict::{CriterionId, CriterionResult, RubricVerdict};
