//! Global atomic counters for trialgate.
//!
//! Counters are bumped at the call site and emitted as one `tracing::info!`
//! event by [`Metrics::flush`], normally at the end of a batch.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no locking.
pub struct Metrics {
    trials_run: AtomicU64,
    trials_passed: AtomicU64,
    executions_timed_out: AtomicU64,
    generation_retries: AtomicU64,
    internal_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            trials_run: AtomicU64::new(0),
            trials_passed: AtomicU64::new(0),
            executions_timed_out: AtomicU64::new(0),
            generation_retries: AtomicU64::new(0),
            internal_errors: AtomicU64::new(0),
        }
    }

    /// Count one finished trial.
    pub fn inc_trials(&self, passed: bool) {
        self.trials_run.fetch_add(1, Ordering::Relaxed);
        if passed {
            self.trials_passed.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(metric = "trials_run", "counter incremented");
    }

    pub fn inc_timeouts(&self) {
        self.executions_timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_timed_out", "counter incremented");
    }

    pub fn inc_generation_retries(&self) {
        self.generation_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "generation_retries", "counter incremented");
    }

    pub fn inc_internal_errors(&self) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "internal_errors", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            trials_run = self.trials_run(),
            trials_passed = self.trials_passed(),
            executions_timed_out = self.executions_timed_out(),
            generation_retries = self.generation_retries(),
            internal_errors = self.internal_errors(),
        );
    }

    pub fn trials_run(&self) -> u64 {
        self.trials_run.load(Ordering::Relaxed)
    }

    pub fn trials_passed(&self) -> u64 {
        self.trials_passed.load(Ordering::Relaxed)
    }

    pub fn executions_timed_out(&self) -> u64 {
        self.executions_timed_out.load(Ordering::Relaxed)
    }

    pub fn generation_retries(&self) -> u64 {
        self.generation_retries.load(Ordering::Relaxed)
    }

    pub fn internal_errors(&self) -> u64 {
        self.internal_errors.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.trials_run.store(0, Ordering::Relaxed);
        self.trials_passed.store(0, Ordering::Relaxed);
        self.executions_timed_out.store(0, Ordering::Relaxed);
        self.generation_retries.store(0, Ordering::Relaxed);
        self.internal_errors.store(0, Ordering::Relaxed);
    }
}
