//! Submission records: at most one successful submission per candidate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::candidate::CandidateId;
use crate::job::FailureRecord;

/// Status of a submission to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    NotSubmitted,
    Submitting,
    Submitted,
    Failed,
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubmissionState::NotSubmitted => "not_submitted",
            SubmissionState::Submitting => "submitting",
            SubmissionState::Submitted => "submitted",
            SubmissionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Full submission record for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub candidate_id: CandidateId,
    pub state: SubmissionState,
    /// Platform confirmation, present once `Submitted`.
    pub confirmation_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<FailureRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubmissionRecord {
    pub fn new(candidate_id: CandidateId) -> Self {
        let now = Utc::now();
        Self {
            candidate_id,
            state: SubmissionState::NotSubmitted,
            confirmation_id: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
