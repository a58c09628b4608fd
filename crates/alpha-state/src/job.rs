//! Simulation job records and the lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::candidate::{Candidate, CandidateId};

/// Lifecycle state of a simulation job.
///
/// ```text
/// QUEUED -> SUBMITTING -> RUNNING -> SUCCEEDED
///              |            |
///              +-> FAILED <-+
///                    |
///                    +-> RETRYING -> SUBMITTING
///
/// QUEUED | SUBMITTING | RUNNING | RETRYING -> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Submitting,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Submitting)
                | (Queued, Cancelled)
                | (Submitting, Running)
                | (Submitting, Failed)
                | (Submitting, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Retrying)
                | (Retrying, Submitting)
                | (Retrying, Cancelled)
        )
    }

    /// Occupies a concurrency slot.
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobState::Submitting | JobState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Submitting => "SUBMITTING",
            JobState::Running => "RUNNING",
            JobState::Retrying => "RETRYING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy shared by simulation and submission paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Platform quota hit.
    RateLimited,
    /// Network or 5xx-class failure.
    Transport,
    /// Session rejected; a fresh login may succeed.
    Auth,
    /// Malformed expression, duplicate alpha or policy violation.
    Rejected,
    /// Per-job wall-clock ceiling elapsed.
    Timeout,
    /// Remote no longer knows the job handle.
    NotFound,
    /// Remote simulation finished in an error state.
    RemoteFailed,
    /// A prior process stopped mid-submission.
    Interrupted,
}

impl FailureKind {
    /// Whether re-attempting the same operation may succeed.
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::Rejected | FailureKind::RemoteFailed)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Transport => "transport",
            FailureKind::Auth => "auth",
            FailureKind::Rejected => "rejected",
            FailureKind::Timeout => "timeout",
            FailureKind::NotFound => "not_found",
            FailureKind::RemoteFailed => "remote_failed",
            FailureKind::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// The last failure observed for a job or submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Opaque remote job token (the platform's progress location).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(pub String);

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One platform-side check (e.g. `LOW_SHARPE`, `CONCENTRATED_WEIGHT`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlphaCheck {
    pub name: String,
    pub result: String,
    #[serde(default)]
    pub limit: Option<f64>,
    #[serde(default)]
    pub value: Option<f64>,
}

impl AlphaCheck {
    pub fn passed(&self) -> bool {
        self.result != "FAIL"
    }
}

/// Performance metrics exposed by a completed simulation.
///
/// Every field is optional: the platform reports different subsets
/// depending on instrument type and settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sharpe: Option<f64>,
    pub fitness: Option<f64>,
    pub turnover: Option<f64>,
    pub returns: Option<f64>,
    pub drawdown: Option<f64>,
    pub margin: Option<f64>,
    pub information_ratio: Option<f64>,
    pub long_count: Option<u64>,
    pub short_count: Option<u64>,
}

/// Payload attached to a job when its simulation completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    /// Platform alpha id produced by the simulation.
    pub alpha_id: Option<String>,
    pub metrics: MetricsSnapshot,
    #[serde(default)]
    pub checks: Vec<AlphaCheck>,
    /// Raw payload as reported by the platform.
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Why a verdict came out the way it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum ReasonCode {
    Accepted,
    SharpeBelowThreshold,
    FitnessBelowThreshold,
    TurnoverAboveThreshold,
    TurnoverBelowThreshold,
    InformationRatioBelowThreshold,
    CheckFailed(String),
    MetricMissing(String),
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReasonCode::Accepted => write!(f, "accepted"),
            ReasonCode::SharpeBelowThreshold => write!(f, "sharpe below threshold"),
            ReasonCode::FitnessBelowThreshold => write!(f, "fitness below threshold"),
            ReasonCode::TurnoverAboveThreshold => write!(f, "turnover above threshold"),
            ReasonCode::TurnoverBelowThreshold => write!(f, "turnover below threshold"),
            ReasonCode::InformationRatioBelowThreshold => {
                write!(f, "information ratio below threshold")
            }
            ReasonCode::CheckFailed(name) => write!(f, "check failed: {name}"),
            ReasonCode::MetricMissing(metric) => write!(f, "{metric} missing"),
        }
    }
}

/// Accept/reject decision derived from a completed simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationVerdict {
    pub candidate_id: CandidateId,
    pub accepted: bool,
    pub reason: ReasonCode,
    pub metrics: MetricsSnapshot,
}

/// Authoritative lifecycle record for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationJob {
    pub candidate: Candidate,
    pub state: JobState,
    pub handle: Option<JobHandle>,
    /// Number of times the job has entered SUBMITTING.
    pub attempts: u32,
    pub last_error: Option<FailureRecord>,
    /// Set once the orchestrator declines to retry a FAILED job.
    #[serde(default)]
    pub retries_exhausted: bool,
    /// Monotonic enqueue order, used for FIFO scheduling and reporting.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub running_since: Option<DateTime<Utc>>,
    pub result: Option<SimulationResult>,
    pub verdict: Option<EvaluationVerdict>,
}

impl SimulationJob {
    /// A freshly enqueued job. `seq` is assigned by the store on insert.
    pub fn queued(candidate: Candidate) -> Self {
        let now = Utc::now();
        Self {
            candidate,
            state: JobState::Queued,
            handle: None,
            attempts: 0,
            last_error: None,
            retries_exhausted: false,
            seq: 0,
            created_at: now,
            updated_at: now,
            running_since: None,
            result: None,
            verdict: None,
        }
    }

    pub fn id(&self) -> &CandidateId {
        self.candidate.id()
    }

    /// Whether this job has reached a state it will never leave.
    pub fn is_settled(&self) -> bool {
        match self.state {
            JobState::Succeeded | JobState::Cancelled => true,
            JobState::Failed => self.retries_exhausted,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::SimulationSettings;

    #[test]
    fn forward_edges_are_allowed() {
        assert!(JobState::Queued.can_transition_to(JobState::Submitting));
        assert!(JobState::Submitting.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
        assert!(JobState::Failed.can_transition_to(JobState::Retrying));
        assert!(JobState::Retrying.can_transition_to(JobState::Submitting));
    }

    #[test]
    fn backward_and_terminal_edges_are_refused() {
        assert!(!JobState::Running.can_transition_to(JobState::Queued));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Failed));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Submitting));
        assert!(!JobState::Failed.can_transition_to(JobState::Submitting));
        assert!(!JobState::Failed.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Queued.can_transition_to(JobState::Running));
    }

    #[test]
    fn failure_classification() {
        assert!(FailureKind::RateLimited.is_retryable());
        assert!(FailureKind::Transport.is_retryable());
        assert!(FailureKind::Auth.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::NotFound.is_retryable());
        assert!(!FailureKind::Rejected.is_retryable());
        assert!(!FailureKind::RemoteFailed.is_retryable());
    }

    #[test]
    fn reason_code_display() {
        assert_eq!(ReasonCode::Accepted.to_string(), "accepted");
        assert_eq!(
            ReasonCode::SharpeBelowThreshold.to_string(),
            "sharpe below threshold"
        );
        assert_eq!(
            ReasonCode::CheckFailed("LOW_SHARPE".into()).to_string(),
            "check failed: LOW_SHARPE"
        );
    }

    #[test]
    fn failed_job_settles_only_when_exhausted() {
        let mut job = SimulationJob::queued(Candidate::new(
            "rank(close)",
            SimulationSettings::default(),
            "",
        ));
        job.state = JobState::Failed;
        assert!(!job.is_settled());
        job.retries_exhausted = true;
        assert!(job.is_settled());
    }
}
