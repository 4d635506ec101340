//! Append-only results recorder.
//!
//! Two files live in the log directory:
//! - `run_summary.log`: one human-readable line per batch
//! - `trials.jsonl`: one JSON line per trial, tagged with its run
//!
//! Appends are serialised by an async mutex held only for the write itself, so
//! concurrent batches never interleave partial lines.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::batch::BatchReport;
use crate::domain::{BatchResult, EngineError, Result, TrialRecord};

pub const SUMMARY_LOG: &str = "run_summary.log";
pub const TRIAL_LOG: &str = "trials.jsonl";

/// One line of the full trial log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialLogEntry {
    pub run_id: Uuid,
    pub run_timestamp: DateTime<Utc>,
    pub record: TrialRecord,
}

/// Writes batch summaries and trial records to the log directory.
#[derive(Debug)]
pub struct ResultsRecorder {
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl ResultsRecorder {
    /// Create the log directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            EngineError::Persistence(format!("cannot create log dir {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir,
            append_lock: Mutex::new(()),
        })
    }

    /// Reader over an existing log directory. Creates nothing; missing logs
    /// read back as empty.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(SUMMARY_LOG)
    }

    pub fn trial_log_path(&self) -> PathBuf {
        self.dir.join(TRIAL_LOG)
    }

    /// Append the batch summary line and every trial line.
    pub async fn record(&self, report: &BatchReport) -> Result<()> {
        let summary = summary_line(&report.result);

        let mut trial_lines = String::new();
        for record in &report.trials {
            let entry = TrialLogEntry {
                run_id: report.result.run_id,
                run_timestamp: report.result.run_timestamp,
                record: record.clone(),
            };
            trial_lines.push_str(&serde_json::to_string(&entry)?);
            trial_lines.push('\n');
        }

        let _guard = self.append_lock.lock().await;
        append(&self.summary_path(), &summary).await?;
        append(&self.trial_log_path(), &trial_lines).await?;
        debug!(
            run_id = %report.result.run_id,
            trials = report.trials.len(),
            "batch recorded"
        );
        Ok(())
    }

    /// Every recorded trial, in file order. Missing log means no history.
    pub async fn history(&self) -> Result<Vec<TrialLogEntry>> {
        let path = self.trial_log_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EngineError::Persistence(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    EngineError::Persistence(format!("{}:{}: {e}", path.display(), n + 1))
                })
            })
            .collect()
    }

    /// Raw summary lines, oldest first.
    pub async fn summaries(&self) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(self.summary_path()).await {
            Ok(raw) => Ok(raw.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(EngineError::Persistence(e.to_string())),
        }
    }
}

/// `<rfc3339> run=<uuid> dataset=<id> trials=<n> passed=<k> pass_rate=<p>% target=[a%, b%] status=<S>`
pub fn summary_line(result: &BatchResult) -> String {
    format!(
        "{} run={} dataset={} trials={} passed={} pass_rate={:.1}% target={} status={}\n",
        result.run_timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        result.run_id,
        result.dataset,
        result.trial_count,
        result.pass_count,
        result.pass_rate * 100.0,
        result.target,
        result.status(),
    )
}

async fn append(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| EngineError::Persistence(format!("cannot open {}: {e}", path.display())))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(|e| EngineError::Persistence(format!("cannot append {}: {e}", path.display())))?;
    file.flush()
        .await
        .map_err(|e| EngineError::Persistence(format!("cannot flush {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TargetInterval;
    use chrono::TimeZone;

    #[test]
    fn test_summary_line_format() {
        let result = BatchResult {
            run_id: Uuid::nil(),
            run_timestamp: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
            dataset: "ticks.csv".into(),
            trial_count: 10,
            pass_count: 3,
            pass_rate: 0.3,
            target: TargetInterval::default(),
            failure_modes: Default::default(),
        };
        assert_eq!(
            summary_line(&result),
            "2025-01-02T03:04:05Z run=00000000-0000-0000-0000-000000000000 dataset=ticks.csv \
             trials=10 passed=3 pass_rate=30.0% target=[10.0%, 40.0%] status=IN_RANGE\n"
        );
    }

    #[tokio::test]
    async fn test_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ResultsRecorder::open(dir.path().join("logs")).await.unwrap();
        assert!(recorder.history().await.unwrap().is_empty());
        assert!(recorder.summaries().await.unwrap().is_empty());
        assert!(recorder.dir().exists());
    }

    #[tokio::test]
    async fn test_at_reads_without_creating() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ResultsRecorder::at(dir.path().join("absent"));
        assert!(recorder.history().await.unwrap().is_empty());
        assert!(recorder.summaries().await.unwrap().is_empty());
        assert!(!recorder.dir().exists());
    }
}
