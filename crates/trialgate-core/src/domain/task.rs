//! Task specification: the immutable per-run rubric configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{EngineError, Result};

/// Comparison operator applied between a metric and its threshold.
///
/// Comparisons are literal: `>=` includes the boundary, `>` excludes it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Comparison {
    #[serde(rename = ">=", alias = "ge")]
    AtLeast,
    #[serde(rename = ">", alias = "gt")]
    GreaterThan,
    #[serde(rename = "<=", alias = "le")]
    AtMost,
    #[serde(rename = "<", alias = "lt")]
    LessThan,
}

impl Comparison {
    /// Evaluate `actual <op> bound`, widened by `tolerance` when one is configured.
    pub fn holds(self, actual: f64, bound: f64, tolerance: Option<f64>) -> bool {
        match (self, tolerance) {
            (Self::AtLeast, None) => actual >= bound,
            (Self::GreaterThan, None) => actual > bound,
            (Self::AtMost, None) => actual <= bound,
            (Self::LessThan, None) => actual < bound,
            (Self::AtLeast, Some(tol)) => actual >= bound - tol,
            (Self::GreaterThan, Some(tol)) => actual > bound - tol,
            (Self::AtMost, Some(tol)) => actual <= bound + tol,
            (Self::LessThan, Some(tol)) => actual < bound + tol,
        }
    }

    /// `true` for operators that put a floor under the metric (`>=`, `>`).
    pub fn is_lower_bound(self) -> bool {
        matches!(self, Self::AtLeast | Self::GreaterThan)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::AtLeast => ">=",
            Self::GreaterThan => ">",
            Self::AtMost => "<=",
            Self::LessThan => "<",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A numeric bound a returned metric must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricThreshold {
    /// Key inside the returned `metrics` mapping.
    pub metric: String,
    pub op: Comparison,
    pub value: f64,
    /// Absolute tolerance; `None` means literal comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
}

impl MetricThreshold {
    pub fn new(metric: impl Into<String>, op: Comparison, value: f64) -> Self {
        Self {
            metric: metric.into(),
            op,
            value,
            tolerance: None,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    pub fn holds(&self, actual: f64) -> bool {
        self.op.holds(actual, self.value, self.tolerance)
    }
}

impl fmt::Display for MetricThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.op, self.value)
    }
}

/// A required capability evidenced by textual patterns in the candidate source.
///
/// The check is a heuristic over source text (regex match), so comments or
/// dead code can satisfy it and aliased imports can defeat it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityRequirement {
    pub tag: String,
    /// Regular expressions; any single match satisfies the requirement.
    pub patterns: Vec<String>,
}

impl CapabilityRequirement {
    /// Recognised technical-indicator call sites.
    pub fn indicator_library() -> Self {
        Self {
            tag: "indicator".to_string(),
            patterns: vec![
                r"\btalib\.\w+\(".to_string(),
                r"\bpandas_ta\b".to_string(),
                r"\bta\.(trend|momentum|volatility|volume)\b".to_string(),
                r"\.ta\.\w+\(".to_string(),
                r"\b(RSI|EMA|SMA|WMA|MACD|BBANDS|ATR|ADX|STOCH|CCI|OBV)\(".to_string(),
            ],
        }
    }
}

/// Immutable per-run task configuration.
///
/// Owned by the tuner; every other component receives it read-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskSpec {
    pub name: String,
    /// Function the candidate must expose.
    pub entrypoint: String,
    /// Required positional parameter count.
    pub arity: usize,
    /// Dataset handle passed as the entrypoint's single argument.
    pub dataset: String,
    /// Optional column name surfaced to the prompt.
    pub target_column: Option<String>,
    /// Top-level keys the returned mapping must contain.
    pub required_keys: Vec<String>,
    /// Validate `signals` items against sell/hold/buy.
    pub validate_signals: bool,
    /// Metrics that must be present and finite, in addition to threshold metrics.
    pub required_metrics: Vec<String>,
    pub thresholds: Vec<MetricThreshold>,
    pub capabilities: Vec<CapabilityRequirement>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            name: "trading-strategy".to_string(),
            entrypoint: "predict_trade".to_string(),
            arity: 1,
            dataset: "task/data/tick_data.csv".to_string(),
            target_column: None,
            required_keys: vec![SIGNALS_KEY.to_string(), METRICS_KEY.to_string()],
            validate_signals: true,
            required_metrics: vec![
                "cumulative_returns_final".to_string(),
                "sharpe_ratio".to_string(),
                "max_drawdown".to_string(),
            ],
            thresholds: vec![
                MetricThreshold::new("sharpe_ratio", Comparison::AtLeast, 1.0),
                MetricThreshold::new("max_drawdown", Comparison::LessThan, 0.25),
                MetricThreshold::new("cumulative_returns_final", Comparison::AtLeast, 0.005),
            ],
            capabilities: vec![CapabilityRequirement::indicator_library()],
        }
    }
}

/// Key holding the discrete signal sequence.
pub const SIGNALS_KEY: &str = "signals";
/// Key holding the named metric mapping.
pub const METRICS_KEY: &str = "metrics";

impl TaskSpec {
    /// All metrics that must be present: explicit ones first, then threshold
    /// metrics, de-duplicated in configuration order.
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let all = self
            .required_metrics
            .iter()
            .chain(self.thresholds.iter().map(|t| &t.metric));
        for name in all {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Reject configurations that cannot produce a meaningful batch.
    pub fn validate(&self) -> Result<()> {
        if self.entrypoint.trim().is_empty() {
            return Err(EngineError::config("task.entrypoint must not be empty"));
        }
        if self.arity == 0 {
            return Err(EngineError::config("task.arity must be at least 1"));
        }
        if self.dataset.trim().is_empty() {
            return Err(EngineError::config("task.dataset must not be empty"));
        }
        for threshold in &self.thresholds {
            if threshold.metric.trim().is_empty() {
                return Err(EngineError::config("threshold metric name must not be empty"));
            }
            if !threshold.value.is_finite() {
                return Err(EngineError::config(format!(
                    "threshold for '{}' must be finite, got {}",
                    threshold.metric, threshold.value
                )));
            }
            if let Some(tol) = threshold.tolerance {
                if !tol.is_finite() || tol < 0.0 {
                    return Err(EngineError::config(format!(
                        "tolerance for '{}' must be a non-negative finite number",
                        threshold.metric
                    )));
                }
            }
        }
        for cap in &self.capabilities {
            if cap.patterns.is_empty() {
                return Err(EngineError::config(format!(
                    "capability '{}' has no patterns",
                    cap.tag
                )));
            }
        }
        Ok(())
    }
}
