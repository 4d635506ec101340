//! Trial records and batch aggregates.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::{EngineError, Result};
use super::outcome::OutcomeSummary;
use super::verdict::RubricVerdict;

const EXCERPT_CHARS: usize = 160;

/// What survives of a candidate after grading: its digest and a short excerpt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFingerprint {
    /// SHA-256 hex digest of the executed source.
    pub sha256: String,
    pub excerpt: String,
    pub bytes: usize,
}

impl CandidateFingerprint {
    pub fn of(source: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        let excerpt: String = source.chars().take(EXCERPT_CHARS).collect();
        Self {
            sha256: hex::encode(hasher.finalize()),
            excerpt,
            bytes: source.len(),
        }
    }

    pub fn short(&self) -> &str {
        &self.sha256[..12.min(self.sha256.len())]
    }
}

/// Immutable record of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial_index: usize,
    pub timestamp: DateTime<Utc>,
    /// Absent when no candidate was ever obtained.
    pub candidate: Option<CandidateFingerprint>,
    pub outcome: OutcomeSummary,
    pub verdict: RubricVerdict,
    pub elapsed_ms: u64,
    /// Generation requests issued (1 = no retries).
    pub generation_attempts: u32,
}

impl TrialRecord {
    pub fn passed(&self) -> bool {
        self.verdict.overall_passed
    }
}

/// Inclusive pass-rate band a tuned task should land in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetInterval {
    pub min: f64,
    pub max: f64,
}

impl TargetInterval {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        let interval = Self { min, max };
        interval.validate()?;
        Ok(interval)
    }

    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_unit(self.min) || !in_unit(self.max) || self.min > self.max {
            return Err(EngineError::config(format!(
                "target interval must satisfy 0 <= min <= max <= 1, got [{}, {}]",
                self.min, self.max
            )));
        }
        Ok(())
    }

    pub fn classify(&self, pass_rate: f64) -> RateStatus {
        if pass_rate < self.min {
            RateStatus::TooLow
        } else if pass_rate > self.max {
            RateStatus::TooHigh
        } else {
            RateStatus::InRange
        }
    }
}

impl Default for TargetInterval {
    fn default() -> Self {
        Self { min: 0.10, max: 0.40 }
    }
}

impl fmt::Display for TargetInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.1}%, {:.1}%]", self.min * 100.0, self.max * 100.0)
    }
}

/// Where a pass rate sits relative to the target interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateStatus {
    TooLow,
    InRange,
    TooHigh,
}

impl fmt::Display for RateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TooLow => "TOO_LOW",
            Self::InRange => "IN_RANGE",
            Self::TooHigh => "TOO_HIGH",
        })
    }
}

/// Derived aggregate of one completed batch. Never mutated after computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub run_id: Uuid,
    pub run_timestamp: DateTime<Utc>,
    pub dataset: String,
    pub trial_count: usize,
    pub pass_count: usize,
    pub pass_rate: f64,
    pub target: TargetInterval,
    /// First failing criterion of each failed trial, counted.
    pub failure_modes: BTreeMap<String, usize>,
}

impl BatchResult {
    /// Aggregate `records`; `trial_count` is the size fixed at batch start.
    pub fn aggregate(
        run_id: Uuid,
        run_timestamp: DateTime<Utc>,
        dataset: impl Into<String>,
        trial_count: usize,
        target: TargetInterval,
        records: &[TrialRecord],
    ) -> Self {
        let pass_count = records.iter().filter(|r| r.passed()).count().min(trial_count);
        let pass_rate = if trial_count == 0 {
            0.0
        } else {
            pass_count as f64 / trial_count as f64
        };

        let mut failure_modes = BTreeMap::new();
        for record in records.iter().filter(|r| !r.passed()) {
            if let Some(failure) = record.verdict.first_failure() {
                *failure_modes
                    .entry(failure.criterion.to_string())
                    .or_insert(0) += 1;
            }
        }

        Self {
            run_id,
            run_timestamp,
            dataset: dataset.into(),
            trial_count,
            pass_count,
            pass_rate,
            target,
            failure_modes,
        }
    }

    pub fn status(&self) -> RateStatus {
        self.target.classify(self.pass_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::verdict::{CriterionId, CriterionResult};

    fn record(index: usize, passed: bool) -> TrialRecord {
        let verdict = if passed {
            RubricVerdict::from_criteria(vec![CriterionResult::pass(CriterionId::ReturnShape, "ok")])
        } else {
            RubricVerdict::single_failure(CriterionId::TimedOut, "exceeded 10ms")
        };
        TrialRecord {
            trial_index: index,
            timestamp: Utc::now(),
            candidate: Some(CandidateFingerprint::of("def predict_trade(p): pass")),
            outcome: OutcomeSummary::internal_error("n/a"),
            verdict,
            elapsed_ms: 1,
            generation_attempts: 1,
        }
    }

    #[test]
    fn test_aggregate_rates() {
        let records: Vec<_> = [true, false, true, true, false]
            .iter()
            .enumerate()
            .map(|(i, p)| record(i, *p))
            .collect();
        let result = BatchResult::aggregate(
            Uuid::new_v4(),
            Utc::now(),
            "data.csv",
            5,
            TargetInterval::default(),
            &records,
        );
        assert_eq!(result.pass_count, 3);
        assert!((result.pass_rate - 0.6).abs() < f64::EPSILON);
        assert_eq!(result.failure_modes.get("timed_out"), Some(&2));
        assert_eq!(result.status(), RateStatus::TooHigh);
    }

    #[test]
    fn test_interval_inclusive() {
        let target = TargetInterval::new(0.1, 0.4).unwrap();
        assert_eq!(target.classify(0.1), RateStatus::InRange);
        assert_eq!(target.classify(0.4), RateStatus::InRange);
        assert_eq!(target.classify(0.0), RateStatus::TooLow);
        assert_eq!(target.classify(0.5), RateStatus::TooHigh);
    }

    #[test]
    fn test_interval_rejects_inverted() {
        assert!(TargetInterval::new(0.5, 0.2).is_err());
        assert!(TargetInterval::new(-0.1, 0.2).is_err());
        assert!(TargetInterval::new(0.1, 1.5).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = CandidateFingerprint::of("print('x')");
        let b = CandidateFingerprint::of("print('x')");
        assert_eq!(a, b);
        assert_eq!(a.sha256.len(), 64);
        assert_eq!(a.short().len(), 12);
    }
}
