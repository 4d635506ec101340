use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::batch::BatchReport;
use crate::tuner::TunerOutcome;

/// Write any report artifact as pretty JSON, creating parent directories.
fn write_json<T: Serialize>(path: &Path, artifact: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    let content = serde_json::to_string_pretty(artifact).context("serialize report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Write a batch report (aggregate plus every trial record).
pub fn write_batch_report_json(path: &Path, report: &BatchReport) -> Result<()> {
    write_json(path, report)
}

/// Write a tuner outcome including its per-attempt history.
pub fn write_tuner_outcome_json(path: &Path, outcome: &TunerOutcome) -> Result<()> {
    write_json(path, outcome)
}

/// Render a markdown summary of one batch.
pub fn render_batch_summary_md(report: &BatchReport) -> String {
    let result = &report.result;
    let mut out = String::new();
    out.push_str("# Batch Summary\n\n");
    out.push_str(&format!(
        "- run: `{}`\n- dataset: `{}`\n- passed: {}/{} ({:.1}%)\n- target: {}\n- status: {}\n\n",
        result.run_id,
        result.dataset,
        result.pass_count,
        result.trial_count,
        result.pass_rate * 100.0,
        result.target,
        result.status(),
    ));

    if !result.failure_modes.is_empty() {
        let mut modes: Vec<_> = result.failure_modes.iter().collect();
        modes.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        out.push_str("## Failure Modes\n\n| criterion | trials |\n|---|---|\n");
        for (criterion, count) in modes {
            out.push_str(&format!("| `{}` | {} |\n", criterion, count));
        }
        out.push('\n');
    }

    out.push_str("## Trials\n\n");
    for trial in &report.trials {
        match trial.verdict.reason() {
            None => out.push_str(&format!("- #{} passed\n", trial.trial_index)),
            Some(reason) => {
                out.push_str(&format!("- #{} failed: {}\n", trial.trial_index, reason))
            }
        }
    }
    out
}
