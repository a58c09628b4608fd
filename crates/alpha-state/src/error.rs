//! Error types for alpha-state

use thiserror::Error;

use crate::job::JobState;
use crate::submission::SubmissionState;

/// Errors that can occur in the state persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// No job recorded for this candidate
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// No submission record for this candidate
    #[error("Submission record not found: {id}")]
    SubmissionNotFound { id: String },

    /// Compare-and-transition lost: the job is not in any expected state
    #[error("Job {id} is {actual}, expected one of [{expected}]")]
    StateConflict {
        id: String,
        actual: JobState,
        expected: String,
    },

    /// The requested transition is not an edge of the lifecycle state machine
    #[error("Illegal transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: JobState,
        to: JobState,
    },

    /// Submission record is not in the expected state
    #[error("Submission {id} is {actual}, expected {expected}")]
    SubmissionConflict {
        id: String,
        actual: SubmissionState,
        expected: SubmissionState,
    },

    /// A verdict may only be attached to a succeeded job
    #[error("Verdict rejected for job {id} in state {state}")]
    VerdictWithoutSuccess { id: String, state: JobState },

    /// Malformed candidate identifier
    #[error("Invalid candidate id: {id}")]
    InvalidCandidateId { id: String },

    /// Snapshot schema version not understood
    #[error("Unsupported snapshot version {found} (expected {expected})")]
    UnsupportedSnapshot { found: u32, expected: u32 },

    /// Lock poisoned by a panicking writer
    #[error("State lock poisoned")]
    Poisoned,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::Poisoned
    }
}
