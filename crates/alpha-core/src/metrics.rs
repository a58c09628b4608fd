//! Global atomic counters for orchestrator observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `tracing::info!`
//! event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    simulations_started: AtomicU64,
    polls_issued: AtomicU64,
    retries_scheduled: AtomicU64,
    submissions_attempted: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            simulations_started: AtomicU64::new(0),
            polls_issued: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            submissions_attempted: AtomicU64::new(0),
        }
    }

    pub fn inc_simulations_started(&self) {
        self.simulations_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "simulations_started", "counter incremented");
    }

    pub fn inc_polls(&self) {
        self.polls_issued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "polls_issued", "counter incremented");
    }

    pub fn inc_retries(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries_scheduled", "counter incremented");
    }

    pub fn inc_submissions(&self) {
        self.submissions_attempted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "submissions_attempted", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            simulations_started = self.simulations_started(),
            polls_issued = self.polls_issued(),
            retries_scheduled = self.retries_scheduled(),
            submissions_attempted = self.submissions_attempted(),
        );
    }

    pub fn simulations_started(&self) -> u64 {
        self.simulations_started.load(Ordering::Relaxed)
    }

    pub fn polls_issued(&self) -> u64 {
        self.polls_issued.load(Ordering::Relaxed)
    }

    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled.load(Ordering::Relaxed)
    }

    pub fn submissions_attempted(&self) -> u64 {
        self.submissions_attempted.load(Ordering::Relaxed)
    }
}
