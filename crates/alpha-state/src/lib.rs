//! Alpha-State: job and submission persistence for the alpha orchestrator
//!
//! This crate owns the data model every other layer speaks in and the
//! authoritative record of each candidate's lifecycle.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: atomic state transitions, deduplication by content identity, and
//! resumable snapshots.
//!
//! ## Key Components
//!
//! - `Candidate` / `CandidateId`: immutable expression + settings, content-addressed
//! - `SimulationJob` / `JobState`: the simulation lifecycle state machine
//! - `SubmissionRecord` / `SubmissionState`: the submission lifecycle
//! - `JobStateStore` / `SubmissionLedger`: storage traits with compare-and-transition
//! - `MemoryStateStore` / `FileStateStore`: in-process and snapshot-backed stores

mod candidate;
mod error;
pub mod file_store;
mod job;
pub mod memory;
pub mod storage_traits;
mod submission;

pub use candidate::{Candidate, CandidateId, SimulationSettings};
pub use error::StoreError;
pub use file_store::FileStateStore;
pub use job::{
    AlphaCheck, EvaluationVerdict, FailureKind, FailureRecord, JobHandle, JobState, MetricsSnapshot,
    ReasonCode, SimulationJob, SimulationResult,
};
pub use memory::MemoryStateStore;
pub use storage_traits::{Claim, JobStateStore, StoreResult, SubmissionLedger};
pub use submission::{SubmissionRecord, SubmissionState};
