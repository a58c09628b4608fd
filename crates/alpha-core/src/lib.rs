//! Alpha Core Library
//!
//! Schedules candidate alphas against a remote simulation platform, evaluates
//! completed simulations against thresholds and submits accepted ones.
//!
//! ## Layer 1 - Orchestration
//!
//! - `source` / `validator`: where candidates come from and what is rejected up front
//! - `orchestrator`: bounded-concurrency simulation lifecycle with retries and timeouts
//! - `reconcile`: startup recovery of jobs left in flight
//! - `evaluation` / `submission`: verdicts and deduplicated submission
//! - `pipeline` / `report`: the end-to-end run and its summary

pub mod config;
pub mod error;
pub mod evaluation;
pub mod fakes;
pub mod gateway;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod pipeline;
pub mod rate_limit;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod source;
pub mod submission;
pub mod telemetry;
pub mod validator;

pub use config::{OrchestratorConfig, PipelineConfig, SubmissionConfig};
pub use error::{AlphaError, EvaluationError, Result, ValidationError};
pub use evaluation::{evaluate, Thresholds};
pub use gateway::{CancelOutcome, ConfirmationId, GatewayError, PollStatus, SimulationGateway};
pub use orchestrator::{SchedulerSummary, SimulationOrchestrator, StopHandle};
pub use pipeline::Pipeline;
pub use rate_limit::RateLimiter;
pub use reconcile::{reconcile, Recovery};
pub use report::RunReport;
pub use retry::{GiveUpReason, PollSchedule, RetryDecision, RetryPolicy};
pub use source::{
    CandidateSource, ExpressionFileSource, IterSource, ParameterSweepSource, RegionFanOutSource,
    ValidatingSource,
};
pub use submission::{SubmissionManager, SubmissionOutcome};
pub use validator::Validator;

pub use alpha_state::{
    Candidate, CandidateId, EvaluationVerdict, FailureKind, FailureRecord, FileStateStore,
    JobHandle, JobState, JobStateStore, MemoryStateStore, SimulationJob, SimulationResult,
    SimulationSettings, SubmissionLedger, SubmissionRecord, SubmissionState,
};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
