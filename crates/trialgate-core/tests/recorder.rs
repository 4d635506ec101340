//! Results recorder: append-only logs survive concurrent writers.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use trialgate_core::recorder::{SUMMARY_LOG, TRIAL_LOG};
use trialgate_core::{
    BatchReport, BatchResult, CandidateFingerprint, CriterionId, OutcomeSummary, ResultsRecorder,
    RubricVerdict, TargetInterval, TrialRecord,
};

fn report(trials: usize) -> BatchReport {
    let records: Vec<TrialRecord> = (0..trials)
        .map(|i| TrialRecord {
            trial_index: i,
            timestamp: Utc::now(),
            candidate: Some(CandidateFingerprint::of(&format!("print({i})"))),
            outcome: OutcomeSummary::generation_failed("stub"),
            verdict: RubricVerdict::single_failure(CriterionId::GenerationFailed, "stub"),
            elapsed_ms: 2,
            generation_attempts: 1,
        })
        .collect();
    let result = BatchResult::aggregate(
        Uuid::new_v4(),
        Utc::now(),
        "ticks.csv",
        trials,
        TargetInterval::default(),
        &records,
    );
    BatchReport {
        result,
        trials: records,
    }
}

#[tokio::test]
async fn test_batches_append_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = ResultsRecorder::open(dir.path()).await.unwrap();

    let first = report(2);
    let second = report(3);
    recorder.record(&first).await.unwrap();
    recorder.record(&second).await.unwrap();

    let summaries = recorder.summaries().await.unwrap();
    assert_eq!(summaries.len(), 2);
    assert!(summaries[0].contains(&format!("run={}", first.result.run_id)));
    assert!(summaries[1].contains("trials=3 passed=0 pass_rate=0.0%"));
    assert!(summaries[1].ends_with("status=TOO_LOW"));

    let history = recorder.history().await.unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].run_id, first.result.run_id);
    assert_eq!(history[4].run_id, second.result.run_id);
    assert_eq!(history[4].record, second.trials[2]);
}

#[tokio::test]
async fn test_reopen_keeps_existing_lines() {
    let dir = tempfile::tempdir().unwrap();
    {
        let recorder = ResultsRecorder::open(dir.path()).await.unwrap();
        recorder.record(&report(1)).await.unwrap();
    }
    let recorder = ResultsRecorder::open(dir.path()).await.unwrap();
    recorder.record(&report(1)).await.unwrap();
    assert_eq!(recorder.summaries().await.unwrap().len(), 2);
    assert!(dir.path().join(SUMMARY_LOG).is_file());
    assert!(dir.path().join(TRIAL_LOG).is_file());
}

#[tokio::test]
async fn test_concurrent_records_do_not_interleave() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(ResultsRecorder::open(dir.path()).await.unwrap());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let recorder = Arc::clone(&recorder);
        handles.push(tokio::spawn(async move {
            recorder.record(&report(4)).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Every line parses, and each run's trials are contiguous.
    let history = recorder.history().await.unwrap();
    assert_eq!(history.len(), 32);
    for chunk in history.chunks(4) {
        assert!(chunk.iter().all(|e| e.run_id == chunk[0].run_id));
        let indices: Vec<usize> = chunk.iter().map(|e| e.record.trial_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }
    assert_eq!(recorder.summaries().await.unwrap().len(), 8);
}

#[tokio::test]
async fn test_corrupt_line_is_persistence_error() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = ResultsRecorder::open(dir.path()).await.unwrap();
    std::fs::write(dir.path().join(TRIAL_LOG), "{not json}\n").unwrap();
    let err = recorder.history().await.unwrap_err();
    assert!(err.to_string().contains("persistence error"));
}
