//! Trialgate Core Library
//!
//! Trial evaluation engine: executes generated submissions against an
//! entrypoint contract, grades them against a rubric, runs batches under a
//! concurrency policy, records the results and tunes task difficulty toward a
//! target pass-rate band.

pub mod batch;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod executor;
pub mod generation;
pub mod grader;
pub mod metrics;
pub mod obs;
pub mod prompt;
pub mod recorder;
pub mod reporting;
pub mod telemetry;
pub mod trial;
pub mod tuner;

pub use batch::{BatchError, BatchOrchestrator, BatchPlan, BatchReport, BatchSource, ConcurrencyPolicy};

pub use config::EngineConfig;

pub use dataset::DatasetRef;

pub use domain::{
    BatchResult, CandidateFingerprint, CapabilityRequirement, Comparison, CriterionId,
    CriterionResult, EngineError, ErrorKind, ExecutorOutcome, MetricThreshold, OutcomeSummary,
    RateStatus, Result, RubricVerdict, TargetInterval, TaskSpec, TrialRecord,
};

pub use executor::{Executor, ExecutorConfig, ExecutorError, InterpreterExecutor};

pub use generation::{
    CandidateGenerator, ChatGenerator, FixtureGenerator, GenerationError, GenerationRequest,
    GeneratorConfig, Provider,
};

pub use grader::Rubric;

pub use prompt::PromptSpec;

pub use recorder::{ResultsRecorder, TrialLogEntry};

pub use trial::{RetryPolicy, TrialRunner};

pub use tuner::{DifficultyTuner, Direction, TunerConfig, TunerOutcome, TunerState};

/// Trialgate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
