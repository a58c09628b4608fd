//! Boundary to the remote simulation platform.
//!
//! The orchestrator and submission manager only ever talk to the platform
//! through `SimulationGateway`, so the HTTP client and the scripted test fake
//! are interchangeable.

use std::time::Duration;

use alpha_state::{Candidate, FailureKind, JobHandle, SimulationResult};
use async_trait::async_trait;

/// Errors surfaced by the platform.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl GatewayError {
    pub fn kind(&self) -> FailureKind {
        match self {
            GatewayError::RateLimited { .. } => FailureKind::RateLimited,
            GatewayError::Rejected(_) => FailureKind::Rejected,
            GatewayError::Transport(_) => FailureKind::Transport,
            GatewayError::Auth(_) => FailureKind::Auth,
        }
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Snapshot of a remote job's progress.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    /// Still running. `retry_after` is the platform's suggested wait.
    Running { retry_after: Option<Duration> },
    Succeeded(SimulationResult),
    Failed(String),
    /// The platform no longer knows the handle.
    NotFound,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The job had already finished or disappeared.
    AlreadyTerminal,
}

/// Platform acknowledgement of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationId(pub String);

impl std::fmt::Display for ConfirmationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote simulation and submission surface.
#[async_trait]
pub trait SimulationGateway: Send + Sync {
    /// Start a simulation. Returns the handle used for polling.
    async fn submit(&self, candidate: &Candidate) -> Result<JobHandle, GatewayError>;

    /// Poll a running simulation.
    async fn poll_status(&self, handle: &JobHandle) -> Result<PollStatus, GatewayError>;

    /// Best-effort cancellation of a running simulation.
    async fn cancel(&self, handle: &JobHandle) -> Result<CancelOutcome, GatewayError>;

    /// Submit a simulated alpha for platform evaluation.
    async fn submit_for_evaluation(
        &self,
        candidate: &Candidate,
        result: &SimulationResult,
    ) -> Result<ConfirmationId, GatewayError>;

    /// Whether `cancel` does anything useful.
    fn supports_cancel(&self) -> bool {
        true
    }
}
