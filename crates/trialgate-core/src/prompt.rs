//! Prompt specification and failure-driven guidance.
//!
//! A prompt is a template with `{dataset}`, `{target_column}` and
//! `{entrypoint}` placeholders. The tuner may attach a guidance section built
//! from a batch's failure reasons; it is rendered just before the
//! `## Implementation Template` heading when the template has one, otherwise
//! at the end.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{EngineError, Result, TaskSpec};

pub const TEMPLATE_MARKER: &str = "## Implementation Template";
pub const GUIDANCE_HEADING: &str = "## Error Analysis and Guidance";

/// Built-in template for the trading-signal task.
pub const DEFAULT_TEMPLATE: &str = "\
You are implementing a trading strategy in Python.

Write a function `{entrypoint}(dataset_path)` that loads the CSV file at
`dataset_path` ({dataset}), computes technical indicators with an indicator
library (talib or pandas_ta), and produces a trading signal for every row.
The target column of interest is `{target_column}`.

The function must return a dictionary with exactly these keys:
- `signals`: a list with one entry per row, each -1 (sell), 0 (hold) or 1 (buy)
- `metrics`: a dictionary with numeric `cumulative_returns_final`,
  `sharpe_ratio` and `max_drawdown`

Reply with a single Python code block and nothing else.

## Implementation Template

```python
import pandas as pd
import talib


def {entrypoint}(dataset_path):
    data = pd.read_csv(dataset_path)
    ...
    return {\"signals\": signals, \"metrics\": metrics}
```
";

const DEFAULT_TARGET_COLUMN: &str = "close";
const MAX_GUIDANCE_REASONS: usize = 8;

/// Prompt template plus the tuner's current guidance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSpec {
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

impl Default for PromptSpec {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE)
    }
}

impl PromptSpec {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            guidance: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let template = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("cannot read prompt {}: {e}", path.display()))
        })?;
        if template.trim().is_empty() {
            return Err(EngineError::config(format!(
                "prompt {} is empty",
                path.display()
            )));
        }
        Ok(Self::new(template))
    }

    /// Render the prompt for one batch. `dataset` is the resolved path the
    /// entrypoint will receive.
    pub fn render(&self, task: &TaskSpec, dataset: &str) -> String {
        let body = self
            .template
            .replace("{dataset}", dataset)
            .replace(
                "{target_column}",
                task.target_column.as_deref().unwrap_or(DEFAULT_TARGET_COLUMN),
            )
            .replace("{entrypoint}", &task.entrypoint);

        let Some(guidance) = self.guidance.as_deref() else {
            return body;
        };
        match body.find(TEMPLATE_MARKER) {
            Some(at) => {
                let (head, tail) = body.split_at(at);
                format!("{}\n\n{}\n\n{}", head.trim_end(), guidance.trim_end(), tail)
            }
            None => format!("{}\n\n{}\n", body.trim_end(), guidance.trim_end()),
        }
    }

    /// Copy with guidance replaced (not accumulated) by one built from
    /// `reasons`. Empty reasons clear the guidance.
    pub fn with_guidance(&self, attempt: u32, reasons: &[(String, usize)]) -> Self {
        Self {
            template: self.template.clone(),
            guidance: (!reasons.is_empty()).then(|| build_guidance(attempt, reasons)),
        }
    }
}

/// Numbered failure reasons (most frequent first, as given) plus hints for
/// the criterion families that appear.
pub fn build_guidance(attempt: u32, reasons: &[(String, usize)]) -> String {
    let mut out = String::new();
    out.push_str(GUIDANCE_HEADING);
    out.push('\n');
    out.push_str(&format!(
        "This is attempt {}. Previous submissions failed for these reasons:\n",
        attempt + 1
    ));
    for (i, (reason, count)) in reasons.iter().take(MAX_GUIDANCE_REASONS).enumerate() {
        out.push_str(&format!("{}. {} (x{})\n", i + 1, reason, count));
    }

    let mentions = |needle: &str| reasons.iter().any(|(r, _)| r.contains(needle));
    let mut hints = Vec::new();
    if mentions("load_error") {
        hints.push("Only import modules that are installed; check the file parses.");
    }
    if mentions("runtime_error") {
        hints.push("Guard divisions and lookups; handle empty or constant series.");
    }
    if mentions("timed_out") {
        hints.push("Vectorise calculations instead of looping row by row.");
    }
    if mentions("return_shape") {
        hints.push("Return a dict with every required key; signals must be -1, 0 or 1.");
    }
    if mentions("metric_present") {
        hints.push("Report every required metric as a finite number.");
    }
    if mentions("threshold") {
        hints.push("Re-check how the failing metrics are computed from the returns.");
    }
    if mentions("capability") {
        hints.push("Compute indicators with the indicator library, not by hand.");
    }
    if !hints.is_empty() {
        out.push_str("\nHints:\n");
        for hint in hints {
            out.push_str("- ");
            out.push_str(hint);
            out.push('\n');
        }
    }
    out
}
