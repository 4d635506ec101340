//! Rubric verdicts: ordered criterion evaluations for one trial.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one independently evaluable rubric check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum CriterionId {
    // Execution failures. A verdict carrying one of these has exactly one criterion.
    LoadError,
    EntrypointMissing,
    SignatureMismatch,
    RuntimeError,
    TimedOut,
    GenerationFailed,
    InternalError,

    /// Returned value has the required structure.
    ReturnShape,
    /// Source evidences a required capability (by tag).
    CapabilityUsage(String),
    /// Metric present and finite (by metric name).
    MetricPresent(String),
    /// Metric satisfies its threshold (by metric name).
    Threshold(String),
}

impl CriterionId {
    /// Whether this criterion describes a failure before grading could begin.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Self::LoadError
                | Self::EntrypointMissing
                | Self::SignatureMismatch
                | Self::RuntimeError
                | Self::TimedOut
                | Self::GenerationFailed
                | Self::InternalError
        )
    }
}

impl fmt::Display for CriterionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadError => f.write_str("load_error"),
            Self::EntrypointMissing => f.write_str("entrypoint_missing"),
            Self::SignatureMismatch => f.write_str("signature_mismatch"),
            Self::RuntimeError => f.write_str("runtime_error"),
            Self::TimedOut => f.write_str("timed_out"),
            Self::GenerationFailed => f.write_str("generation_failed"),
            Self::InternalError => f.write_str("internal_error"),
            Self::ReturnShape => f.write_str("return_shape"),
            Self::CapabilityUsage(tag) => write!(f, "capability:{tag}"),
            Self::MetricPresent(name) => write!(f, "metric_present:{name}"),
            Self::Threshold(name) => write!(f, "threshold:{name}"),
        }
    }
}

/// One evaluated criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: CriterionId,
    pub passed: bool,
    pub detail: String,
}

impl CriterionResult {
    pub fn pass(criterion: CriterionId, detail: impl Into<String>) -> Self {
        Self {
            criterion,
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(criterion: CriterionId, detail: impl Into<String>) -> Self {
        Self {
            criterion,
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Structured outcome of grading one trial.
///
/// # Invariants
///
/// `overall_passed` is the conjunction of every criterion and is never true for
/// an empty criterion list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RubricVerdict {
    pub criteria: Vec<CriterionResult>,
    pub overall_passed: bool,
}

impl RubricVerdict {
    pub fn from_criteria(criteria: Vec<CriterionResult>) -> Self {
        let overall_passed = !criteria.is_empty() && criteria.iter().all(|c| c.passed);
        Self {
            criteria,
            overall_passed,
        }
    }

    /// Verdict consisting of a single failing criterion.
    pub fn single_failure(criterion: CriterionId, detail: impl Into<String>) -> Self {
        Self::from_criteria(vec![CriterionResult::fail(criterion, detail)])
    }

    /// The first failing criterion in evaluation order.
    pub fn first_failure(&self) -> Option<&CriterionResult> {
        self.criteria.iter().find(|c| !c.passed)
    }

    /// Human-readable reason: `"<criterion>: <detail>"` of the first failure.
    pub fn reason(&self) -> Option<String> {
        self.first_failure()
            .map(|c| format!("{}: {}", c.criterion, c.detail))
    }

    pub fn failures(&self) -> impl Iterator<Item = &CriterionResult> {
        self.criteria.iter().filter(|c| !c.passed)
    }
}
