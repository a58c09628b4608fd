//! Structured observability hooks for job and run lifecycle events.
//!
//! This module provides:
//! - Job-scoped tracing spans for worker tasks via [`job_span`]
//! - Emission functions for lifecycle events: transitions, retries,
//!   verdicts, submissions and run completion
//!
//! Events are emitted at `info!` level unless noted. Set `RUST_LOG` to filter
//! and pass `--json` to the CLI for JSON output.

use std::time::Duration;

use alpha_state::{CandidateId, FailureKind, JobHandle, JobState, ReasonCode};
use tracing::{info, warn};

/// Span for a job's worker task, for use with `Instrument`.
pub fn job_span(id: &CandidateId) -> tracing::Span {
    tracing::info_span!("alpha.job", candidate_id = %id.short())
}

/// Emit event: job moved between lifecycle states.
pub fn emit_job_transition(id: &CandidateId, from: JobState, to: JobState, attempts: u32) {
    info!(
        event = "job.transition",
        candidate_id = %id.short(),
        from = %from,
        to = %to,
        attempts = attempts,
    );
}

/// Emit event: a failed attempt will be retried after `delay`.
pub fn emit_retry_scheduled(id: &CandidateId, kind: FailureKind, attempts: u32, delay: Duration) {
    info!(
        event = "job.retry_scheduled",
        candidate_id = %id.short(),
        kind = %kind,
        attempts = attempts,
        delay_ms = delay.as_millis() as u64,
    );
}

/// Emit event: a job failed and will not be retried.
pub fn emit_job_gave_up(id: &CandidateId, kind: FailureKind, attempts: u32, reason: &str) {
    warn!(
        event = "job.gave_up",
        candidate_id = %id.short(),
        kind = %kind,
        attempts = attempts,
        reason = %reason,
    );
}

/// Emit event: a timed-out job could not be cancelled remotely.
pub fn emit_job_orphaned(id: &CandidateId, handle: &JobHandle) {
    warn!(
        event = "job.orphaned",
        candidate_id = %id.short(),
        handle = %handle,
    );
}

/// Emit event: verdict computed for a completed simulation.
pub fn emit_verdict_evaluated(id: &CandidateId, accepted: bool, reason: &ReasonCode) {
    info!(
        event = "verdict.evaluated",
        candidate_id = %id.short(),
        accepted = accepted,
        reason = %reason,
    );
}

/// Emit event: submission reached a final outcome for this run.
pub fn emit_submission_finished(id: &CandidateId, outcome: &str, attempts: u32) {
    info!(
        event = "submission.finished",
        candidate_id = %id.short(),
        outcome = %outcome,
        attempts = attempts,
    );
}

/// Emit event: pipeline run finished.
pub fn emit_run_finished(
    duration_ms: u64,
    total: usize,
    succeeded: usize,
    failed: usize,
    cancelled: usize,
    submitted: usize,
) {
    info!(
        event = "run.finished",
        duration_ms = duration_ms,
        total = total,
        succeeded = succeeded,
        failed = failed,
        cancelled = cancelled,
        submitted = submitted,
    );
}
