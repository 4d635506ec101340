//! Rubric grader.
//!
//! Evaluates an [`ExecutorOutcome`] (plus the candidate source, for the textual
//! capability check) against a [`TaskSpec`] and produces a [`RubricVerdict`].
//!
//! Evaluation order is fixed:
//!
//! 1. structural: the outcome returned a mapping with the required keys;
//!    failing this stops evaluation
//! 2. capability: the source matches at least one pattern per requirement
//! 3. metric presence: every required metric is a finite number
//! 4. thresholds: each present, finite metric against its bound
//!
//! Grading is pure: the same outcome and source always yield the same verdict.

use regex::Regex;
use serde_json::Value;

use crate::domain::{
    CriterionId, CriterionResult, EngineError, ErrorKind, ExecutorOutcome, MetricThreshold,
    Result, RubricVerdict, TaskSpec, METRICS_KEY, SIGNALS_KEY,
};

/// Marker key the execution harness uses for NaN/inf floats.
pub const NON_FINITE_MARKER: &str = "$nonfinite";

const SIGNAL_SYMBOLS: [&str; 3] = ["sell", "hold", "buy"];

struct CompiledCapability {
    tag: String,
    patterns: Vec<Regex>,
}

/// A task's rubric with its capability patterns compiled.
pub struct Rubric {
    required_keys: Vec<String>,
    validate_signals: bool,
    metric_names: Vec<String>,
    thresholds: Vec<MetricThreshold>,
    capabilities: Vec<CompiledCapability>,
}

impl Rubric {
    /// Build the rubric for `task`. Invalid patterns are configuration errors.
    pub fn from_task(task: &TaskSpec) -> Result<Self> {
        let mut capabilities = Vec::with_capacity(task.capabilities.len());
        for cap in &task.capabilities {
            let patterns = cap
                .patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        EngineError::config(format!(
                            "capability '{}' has invalid pattern '{}': {}",
                            cap.tag, p, e
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            capabilities.push(CompiledCapability {
                tag: cap.tag.clone(),
                patterns,
            });
        }

        Ok(Self {
            required_keys: task.required_keys.clone(),
            validate_signals: task.validate_signals,
            metric_names: task.metric_names(),
            thresholds: task.thresholds.clone(),
            capabilities,
        })
    }

    /// Grade one executed candidate.
    pub fn grade(&self, outcome: &ExecutorOutcome, source: &str) -> RubricVerdict {
        let value = match outcome {
            ExecutorOutcome::Returned { value } => value,
            other => return execution_failure_verdict(other),
        };

        let metrics = match self.check_structure(value) {
            Ok(metrics) => metrics,
            Err(detail) => return RubricVerdict::single_failure(CriterionId::ReturnShape, detail),
        };

        let mut criteria = vec![CriterionResult::pass(
            CriterionId::ReturnShape,
            format!("returned mapping with keys {:?}", self.required_keys),
        )];

        for cap in &self.capabilities {
            criteria.push(check_capability(cap, source));
        }

        for name in &self.metric_names {
            let criterion = CriterionId::MetricPresent(name.clone());
            criteria.push(match metric_value(metrics, name) {
                Ok(v) => CriterionResult::pass(criterion, format!("{name} = {v}")),
                Err(detail) => CriterionResult::fail(criterion, detail),
            });
        }

        for threshold in &self.thresholds {
            // Missing or non-finite metrics already failed their presence check.
            let Ok(actual) = metric_value(metrics, &threshold.metric) else {
                continue;
            };
            let criterion = CriterionId::Threshold(threshold.metric.clone());
            criteria.push(if threshold.holds(actual) {
                CriterionResult::pass(criterion, format!("{} satisfies {}", actual, threshold))
            } else {
                CriterionResult::fail(
                    criterion,
                    format!("{} = {} does not satisfy {}", threshold.metric, actual, threshold),
                )
            });
        }

        RubricVerdict::from_criteria(criteria)
    }

    /// Structural check; returns the metrics mapping on success.
    fn check_structure<'a>(
        &self,
        value: &'a Value,
    ) -> std::result::Result<&'a serde_json::Map<String, Value>, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("expected a mapping, got {}", type_name(value)))?;

        let missing: Vec<&str> = self
            .required_keys
            .iter()
            .filter(|k| !obj.contains_key(k.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required key(s): {}", missing.join(", ")));
        }

        if self.validate_signals {
            if let Some(signals) = obj.get(SIGNALS_KEY) {
                check_signals(signals)?;
            }
        }

        match obj.get(METRICS_KEY) {
            Some(Value::Object(metrics)) => Ok(metrics),
            Some(other) => Err(format!(
                "'{METRICS_KEY}' must be a mapping, got {}",
                type_name(other)
            )),
            None if self.metric_names.is_empty() => Ok(empty_map()),
            None => Err(format!("missing required key(s): {METRICS_KEY}")),
        }
    }
}

fn empty_map() -> &'static serde_json::Map<String, Value> {
    static EMPTY: std::sync::OnceLock<serde_json::Map<String, Value>> = std::sync::OnceLock::new();
    EMPTY.get_or_init(serde_json::Map::new)
}

fn check_signals(signals: &Value) -> std::result::Result<(), String> {
    let items = signals.as_array().ok_or_else(|| {
        format!(
            "'{SIGNALS_KEY}' must be a sequence, got {}",
            type_name(signals)
        )
    })?;
    for (i, item) in items.iter().enumerate() {
        let ok = match item {
            Value::Number(n) => n
                .as_f64()
                .map(|v| v == -1.0 || v == 0.0 || v == 1.0)
                .unwrap_or(false),
            Value::String(s) => SIGNAL_SYMBOLS.contains(&s.to_ascii_lowercase().as_str()),
            _ => false,
        };
        if !ok {
            return Err(format!(
                "signal #{i} is {item}, expected one of sell/hold/buy (or -1/0/1)"
            ));
        }
    }
    Ok(())
}

fn check_capability(cap: &CompiledCapability, source: &str) -> CriterionResult {
    let criterion = CriterionId::CapabilityUsage(cap.tag.clone());
    match cap.patterns.iter().find(|re| re.is_match(source)) {
        Some(re) => CriterionResult::pass(criterion, format!("matched /{}/", re.as_str())),
        None => CriterionResult::fail(
            criterion,
            format!("no recognised '{}' usage found in source", cap.tag),
        ),
    }
}

/// Finite numeric value of `name`, or a reason it does not qualify.
fn metric_value(
    metrics: &serde_json::Map<String, Value>,
    name: &str,
) -> std::result::Result<f64, String> {
    match metrics.get(name) {
        None => Err(format!("metric '{name}' is missing")),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() => Ok(v),
            _ => Err(format!("metric '{name}' is not a finite number")),
        },
        Some(Value::Object(obj)) if obj.contains_key(NON_FINITE_MARKER) => {
            let which = obj
                .get(NON_FINITE_MARKER)
                .and_then(Value::as_str)
                .unwrap_or("non-finite");
            Err(format!("metric '{name}' is {which}"))
        }
        Some(other) => Err(format!(
            "metric '{name}' has wrong type: expected number, got {}",
            type_name(other)
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// Verdict for an outcome that never returned a value.
fn execution_failure_verdict(outcome: &ExecutorOutcome) -> RubricVerdict {
    match outcome {
        ExecutorOutcome::Returned { .. } => {
            RubricVerdict::single_failure(CriterionId::InternalError, "returned outcome misrouted")
        }
        ExecutorOutcome::RaisedError {
            kind: ErrorKind::Load,
            message,
        } => RubricVerdict::single_failure(
            CriterionId::LoadError,
            format!("candidate failed to load: {message}"),
        ),
        ExecutorOutcome::RaisedError { kind, message } => RubricVerdict::single_failure(
            CriterionId::RuntimeError,
            format!("entrypoint raised {kind} error: {message}"),
        ),
        ExecutorOutcome::TimedOut { limit_ms } => RubricVerdict::single_failure(
            CriterionId::TimedOut,
            format!("execution exceeded {limit_ms}ms"),
        ),
        ExecutorOutcome::EntrypointMissing { entrypoint } => RubricVerdict::single_failure(
            CriterionId::EntrypointMissing,
            format!("function '{entrypoint}' not found"),
        ),
        ExecutorOutcome::SignatureMismatch { expected, actual } => RubricVerdict::single_failure(
            CriterionId::SignatureMismatch,
            format!("expected {expected} positional parameter(s), found {actual}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CapabilityRequirement, Comparison};
    use serde_json::json;

    const SOURCE: &str = "import talib\ndef predict_trade(p):\n    rsi = talib.RSI(c)\n";

    fn task() -> TaskSpec {
        TaskSpec {
            required_metrics: vec![],
            thresholds: vec![
                MetricThreshold::new("sharpe_ratio", Comparison::AtLeast, 1.0),
                MetricThreshold::new("max_drawdown", Comparison::LessThan, 0.25),
            ],
            ..TaskSpec::default()
        }
    }

    fn returned(sharpe: Value, drawdown: Value) -> ExecutorOutcome {
        ExecutorOutcome::Returned {
            value: json!({
                "signals": [1, 0, -1, "hold"],
                "metrics": {"sharpe_ratio": sharpe, "max_drawdown": drawdown}
            }),
        }
    }

    #[test]
    fn test_passing_submission() {
        let rubric = Rubric::from_task(&task()).unwrap();
        let verdict = rubric.grade(&returned(json!(1.5), json!(0.1)), SOURCE);
        assert!(verdict.overall_passed, "{:?}", verdict);
        // shape + capability + 2 presence + 2 thresholds
        assert_eq!(verdict.criteria.len(), 6);
    }

    #[test]
    fn test_boundary_operator_exactness() {
        let rubric = Rubric::from_task(&task()).unwrap();
        let verdict = rubric.grade(&returned(json!(1.0), json!(0.1)), SOURCE);
        assert!(verdict.overall_passed);

        let strict = TaskSpec {
            thresholds: vec![MetricThreshold::new("sharpe_ratio", Comparison::GreaterThan, 1.0)],
            ..task()
        };
        let rubric = Rubric::from_task(&strict).unwrap();
        let verdict = rubric.grade(&returned(json!(1.0), json!(0.1)), SOURCE);
        assert!(!verdict.overall_passed);
        assert_eq!(
            verdict.first_failure().unwrap().criterion,
            CriterionId::Threshold("sharpe_ratio".into())
        );
    }

    #[test]
    fn test_structural_failure_short_circuits() {
        let rubric = Rubric::from_task(&task()).unwrap();
        let outcome = ExecutorOutcome::Returned {
            value: json!({"signals": [1]}),
        };
        let verdict = rubric.grade(&outcome, SOURCE);
        assert_eq!(verdict.criteria.len(), 1);
        assert_eq!(verdict.criteria[0].criterion, CriterionId::ReturnShape);
        assert!(verdict.criteria[0].detail.contains("metrics"));
    }

    #[test]
    fn test_non_mapping_return() {
        let rubric = Rubric::from_task(&task()).unwrap();
        let outcome = ExecutorOutcome::Returned { value: json!([1, 2]) };
        let verdict = rubric.grade(&outcome, SOURCE);
        assert!(verdict.reason().unwrap().contains("expected a mapping, got sequence"));
    }

    #[test]
    fn test_invalid_signal_symbol() {
        let rubric = Rubric::from_task(&task()).unwrap();
        let outcome = ExecutorOutcome::Returned {
            value: json!({"signals": [1, "short"], "metrics": {}}),
        };
        let verdict = rubric.grade(&outcome, SOURCE);
        assert_eq!(verdict.criteria.len(), 1);
        assert!(verdict.criteria[0].detail.contains("signal #1"));
    }

    #[test]
    fn test_all_missing_metrics_reported() {
        let rubric = Rubric::from_task(&task()).unwrap();
        let outcome = ExecutorOutcome::Returned {
            value: json!({"signals": [], "metrics": {}}),
        };
        let verdict = rubric.grade(&outcome, SOURCE);
        let missing: Vec<_> = verdict
            .failures()
            .filter(|c| matches!(c.criterion, CriterionId::MetricPresent(_)))
            .collect();
        assert_eq!(missing.len(), 2);
        // Thresholds are skipped for metrics that are absent.
        assert!(!verdict
            .criteria
            .iter()
            .any(|c| matches!(c.criterion, CriterionId::Threshold(_))));
    }

    #[test]
    fn test_non_finite_and_wrong_type_fail_presence() {
        let rubric = Rubric::from_task(&task()).unwrap();
        let outcome = returned(json!({"$nonfinite": "nan"}), json!("0.1"));
        let verdict = rubric.grade(&outcome, SOURCE);
        let details: Vec<_> = verdict.failures().map(|c| c.detail.clone()).collect();
        assert!(details.iter().any(|d| d.contains("is nan")));
        assert!(details.iter().any(|d| d.contains("wrong type")));
    }

    #[test]
    fn test_capability_missing_is_recorded_but_not_short_circuit() {
        let rubric = Rubric::from_task(&task()).unwrap();
        let verdict = rubric.grade(&returned(json!(2.0), json!(0.1)), "def predict_trade(p): pass");
        assert!(!verdict.overall_passed);
        assert_eq!(
            verdict.first_failure().unwrap().criterion,
            CriterionId::CapabilityUsage("indicator".into())
        );
        assert!(verdict
            .criteria
            .iter()
            .any(|c| c.criterion == CriterionId::Threshold("sharpe_ratio".into()) && c.passed));
    }

    #[test]
    fn test_missing_entrypoint_single_criterion() {
        let rubric = Rubric::from_task(&task()).unwrap();
        let outcome = ExecutorOutcome::EntrypointMissing {
            entrypoint: "predict_trade".into(),
        };
        let verdict = rubric.grade(&outcome, SOURCE);
        assert!(!verdict.overall_passed);
        assert_eq!(verdict.criteria.len(), 1);
        assert_eq!(verdict.criteria[0].criterion, CriterionId::EntrypointMissing);
    }

    #[test]
    fn test_runtime_error_names_kind() {
        let rubric = Rubric::from_task(&task()).unwrap();
        let outcome = ExecutorOutcome::RaisedError {
            kind: ErrorKind::DivisionByZero,
            message: "division by zero".into(),
        };
        let verdict = rubric.grade(&outcome, SOURCE);
        assert_eq!(verdict.criteria[0].criterion, CriterionId::RuntimeError);
        assert!(verdict.criteria[0].detail.contains("division_by_zero"));
    }

    #[test]
    fn test_grading_is_idempotent() {
        let rubric = Rubric::from_task(&task()).unwrap();
        let outcome = returned(json!(0.7), json!(0.3));
        assert_eq!(rubric.grade(&outcome, SOURCE), rubric.grade(&outcome, SOURCE));
    }

    #[test]
    fn test_invalid_pattern_is_configuration_error() {
        let bad = TaskSpec {
            capabilities: vec![CapabilityRequirement {
                tag: "broken".into(),
                patterns: vec!["(".into()],
            }],
            ..task()
        };
        let err = Rubric::from_task(&bad).err().unwrap();
        assert!(err.is_configuration());
    }
}
