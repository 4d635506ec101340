//! Structured lifecycle events for batches, trials and the tuner.
//!
//! Events are emitted at `info!` (failures at `warn!`) with an `event` field
//! so JSON output can be filtered by kind.

use std::future::Future;

use tracing::instrument::Instrumented;
use tracing::{info, warn, Instrument, Span};
use uuid::Uuid;

use crate::domain::{BatchResult, TrialRecord};

/// Run-scoped span for one batch.
///
/// Async code instruments its future with the span rather than holding an
/// entered guard across await points.
///
/// ```ignore
/// let span = BatchSpan::new(&run_id, "ticks.csv");
/// let report = span.instrument(run_trials()).await;
/// ```
pub struct BatchSpan {
    span: Span,
}

impl BatchSpan {
    pub fn new(run_id: &Uuid, dataset: &str) -> Self {
        Self {
            span: tracing::info_span!("trialgate.batch", run_id = %run_id, dataset = %dataset),
        }
    }

    pub fn instrument<F: Future>(&self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span.clone())
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Emit event: batch dispatched.
pub fn emit_batch_started(run_id: &Uuid, trials: usize, max_in_flight: usize) {
    info!(
        event = "batch.started",
        run_id = %run_id,
        trials = trials,
        max_in_flight = max_in_flight,
    );
}

/// Emit event: one trial graded.
pub fn emit_trial_finished(record: &TrialRecord) {
    let reason = record.verdict.reason().unwrap_or_default();
    info!(
        event = "trial.finished",
        trial = record.trial_index,
        passed = record.passed(),
        status = %record.outcome.status,
        elapsed_ms = record.elapsed_ms,
        reason = %reason,
    );
}

/// Emit event: batch aggregated.
pub fn emit_batch_finished(result: &BatchResult, duration_ms: u64) {
    info!(
        event = "batch.finished",
        run_id = %result.run_id,
        trials = result.trial_count,
        passed = result.pass_count,
        pass_rate = result.pass_rate,
        status = %result.status(),
        duration_ms = duration_ms,
    );
}

/// Emit event: the tuner moved between states.
pub fn emit_tuner_transition(attempt: u32, from: &str, to: &str, pass_rate: Option<f64>) {
    info!(
        event = "tuner.transition",
        attempt = attempt,
        from = %from,
        to = %to,
        pass_rate = pass_rate.unwrap_or(f64::NAN),
    );
}

/// Emit event: a log append failed; the in-memory result is still returned.
pub fn emit_recorder_append_failed(run_id: &Uuid, error: &dyn std::fmt::Display) {
    warn!(event = "recorder.append_failed", run_id = %run_id, error = %error);
}
