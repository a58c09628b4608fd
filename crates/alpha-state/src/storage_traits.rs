//! Storage trait definitions for the orchestrator
//!
//! These traits define the two storage abstractions:
//! - `JobStateStore`: simulation job lifecycle (compare-and-transition)
//! - `SubmissionLedger`: deduplicated submission records
//!
//! Both are synchronous: every operation is a short critical section, so
//! callers on the async runtime never hold a lock across a suspension point.
//! `MemoryStateStore` and `FileStateStore` implement both.

use crate::candidate::CandidateId;
use crate::error::StoreError;
use crate::job::{EvaluationVerdict, JobState, SimulationJob};
use crate::submission::{SubmissionRecord, SubmissionState};

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// JobStateStore: simulation job lifecycle
// ---------------------------------------------------------------------------

/// Authoritative mapping from candidate id to its simulation job.
///
/// Guarantees:
/// - At most one job per `CandidateId` (`insert_if_absent`).
/// - Every state change goes through `compare_and_transition`, which fails
///   if the job is not currently in one of `expected` or if the edge is not
///   part of the lifecycle graph. Two workers racing on the same job cannot
///   both win.
/// - Enqueue order (`SimulationJob::seq`) is assigned on insert and is
///   strictly increasing.
pub trait JobStateStore: Send + Sync {
    /// Insert a QUEUED job unless one already exists for the same id.
    ///
    /// Returns the stored job (new or existing) and whether it was inserted.
    fn insert_if_absent(&self, job: SimulationJob) -> StoreResult<(SimulationJob, bool)>;

    /// Fetch a job by id.
    fn get(&self, id: &CandidateId) -> StoreResult<Option<SimulationJob>>;

    /// Atomically move a job from one of `expected` to `next`, applying
    /// `update` to the record under the same lock. Returns the updated job.
    fn compare_and_transition(
        &self,
        id: &CandidateId,
        expected: &[JobState],
        next: JobState,
        update: &mut dyn FnMut(&mut SimulationJob),
    ) -> StoreResult<SimulationJob>;

    /// Mutate a job without changing its state (e.g. marking retries
    /// exhausted on a FAILED job). Fails if the job is not in `expected`.
    fn update_in_place(
        &self,
        id: &CandidateId,
        expected: JobState,
        update: &mut dyn FnMut(&mut SimulationJob),
    ) -> StoreResult<SimulationJob>;

    /// Attach a verdict. Only SUCCEEDED jobs may carry one.
    fn record_verdict(&self, verdict: EvaluationVerdict) -> StoreResult<SimulationJob>;

    /// All jobs currently in `state`, in enqueue order.
    fn in_state(&self, state: JobState) -> StoreResult<Vec<SimulationJob>>;

    /// Every job, in enqueue order.
    fn all(&self) -> StoreResult<Vec<SimulationJob>>;
}

// ---------------------------------------------------------------------------
// SubmissionLedger: deduplicated submissions
// ---------------------------------------------------------------------------

/// Outcome of trying to claim a candidate for submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The caller owns the submission; the record is now `Submitting`.
    Claimed(SubmissionRecord),
    /// Another worker is already submitting this candidate.
    InProgress(SubmissionRecord),
    /// The candidate was already submitted.
    AlreadySubmitted(SubmissionRecord),
    /// A previous submission failed terminally; requires an explicit reset.
    PreviouslyFailed(SubmissionRecord),
}

/// Submission records keyed by candidate id.
///
/// Guarantees:
/// - `claim` is atomic: of N concurrent claims for one id, exactly one
///   returns `Claimed`.
/// - A record reaches `Submitted` at most once and never leaves it.
/// - `Failed` records are only re-opened by `reset_failed`.
pub trait SubmissionLedger: Send + Sync {
    /// Claim `id` for submission (absent/`NotSubmitted` -> `Submitting`).
    fn claim(&self, id: &CandidateId) -> StoreResult<Claim>;

    /// Mutate a `Submitting` record, optionally moving it to `next`.
    fn update_submission(
        &self,
        id: &CandidateId,
        next: SubmissionState,
        update: &mut dyn FnMut(&mut SubmissionRecord),
    ) -> StoreResult<SubmissionRecord>;

    /// Startup recovery: every record left `Submitting` by a previous
    /// process moves back to `NotSubmitted`. Returns the released records.
    fn release_interrupted(&self) -> StoreResult<Vec<SubmissionRecord>>;

    /// Operator action: move a `Failed` record back to `NotSubmitted`.
    fn reset_failed(&self, id: &CandidateId) -> StoreResult<SubmissionRecord>;

    /// Fetch a record by id.
    fn get_submission(&self, id: &CandidateId) -> StoreResult<Option<SubmissionRecord>>;

    /// Every submission record.
    fn all_submissions(&self) -> StoreResult<Vec<SubmissionRecord>>;
}
