//! In-memory state store
//!
//! `MemoryStateStore` implements both `JobStateStore` and `SubmissionLedger`
//! behind a single mutex. It is the working set for `FileStateStore` and is
//! used directly when durability across restarts is not needed.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::candidate::CandidateId;
use crate::error::StoreError;
use crate::job::{EvaluationVerdict, FailureKind, FailureRecord, JobState, SimulationJob};
use crate::storage_traits::*;
use crate::submission::{SubmissionRecord, SubmissionState};

/// Serializable image of a store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub next_seq: u64,
    pub jobs: Vec<SimulationJob>,
    pub submissions: Vec<SubmissionRecord>,
}

impl StoreSnapshot {
    pub const VERSION: u32 = 1;
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<CandidateId, SimulationJob>,
    submissions: HashMap<CandidateId, SubmissionRecord>,
    next_seq: u64,
}

impl Inner {
    fn sorted_jobs<'a>(&self, jobs: impl Iterator<Item = &'a SimulationJob>) -> Vec<SimulationJob> {
        let mut out: Vec<SimulationJob> = jobs.cloned().collect();
        out.sort_by_key(|j| j.seq);
        out
    }
}

/// In-memory store backed by `HashMap`s under one `Mutex`.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self, StoreError> {
        if snapshot.version != StoreSnapshot::VERSION {
            return Err(StoreError::UnsupportedSnapshot {
                found: snapshot.version,
                expected: StoreSnapshot::VERSION,
            });
        }
        let max_seq = snapshot.jobs.iter().map(|j| j.seq + 1).max().unwrap_or(0);
        let inner = Inner {
            jobs: snapshot
                .jobs
                .into_iter()
                .map(|j| (j.id().clone(), j))
                .collect(),
            submissions: snapshot
                .submissions
                .into_iter()
                .map(|s| (s.candidate_id.clone(), s))
                .collect(),
            next_seq: snapshot.next_seq.max(max_seq),
        };
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Swap in the contents of `other`, consuming it.
    pub(crate) fn replace_with(&self, other: MemoryStateStore) -> Result<(), StoreError> {
        let staged = other.inner.into_inner()?;
        *self.inner.lock()? = staged;
        Ok(())
    }

    /// Capture the current contents.
    pub fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let inner = self.inner.lock()?;
        let mut submissions: Vec<SubmissionRecord> = inner.submissions.values().cloned().collect();
        submissions.sort_by(|a, b| a.candidate_id.cmp(&b.candidate_id));
        Ok(StoreSnapshot {
            version: StoreSnapshot::VERSION,
            next_seq: inner.next_seq,
            jobs: inner.sorted_jobs(inner.jobs.values()),
            submissions,
        })
    }
}

fn expected_list(expected: &[JobState]) -> String {
    expected
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl JobStateStore for MemoryStateStore {
    fn insert_if_absent(&self, mut job: SimulationJob) -> StoreResult<(SimulationJob, bool)> {
        let mut inner = self.inner.lock()?;
        if let Some(existing) = inner.jobs.get(job.id()) {
            return Ok((existing.clone(), false));
        }
        job.seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(job.id().clone(), job.clone());
        Ok((job, true))
    }

    fn get(&self, id: &CandidateId) -> StoreResult<Option<SimulationJob>> {
        let inner = self.inner.lock()?;
        Ok(inner.jobs.get(id).cloned())
    }

    fn compare_and_transition(
        &self,
        id: &CandidateId,
        expected: &[JobState],
        next: JobState,
        update: &mut dyn FnMut(&mut SimulationJob),
    ) -> StoreResult<SimulationJob> {
        let mut inner = self.inner.lock()?;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound { id: id.to_string() })?;
        if !expected.contains(&job.state) {
            return Err(StoreError::StateConflict {
                id: id.to_string(),
                actual: job.state,
                expected: expected_list(expected),
            });
        }
        if !job.state.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from: job.state,
                to: next,
            });
        }
        let mut updated = job.clone();
        update(&mut updated);
        updated.state = next;
        updated.updated_at = Utc::now();
        if next == JobState::Running && updated.running_since.is_none() {
            updated.running_since = Some(updated.updated_at);
        }
        if next == JobState::Submitting {
            updated.running_since = None;
        }
        *job = updated.clone();
        Ok(updated)
    }

    fn update_in_place(
        &self,
        id: &CandidateId,
        expected: JobState,
        update: &mut dyn FnMut(&mut SimulationJob),
    ) -> StoreResult<SimulationJob> {
        let mut inner = self.inner.lock()?;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound { id: id.to_string() })?;
        if job.state != expected {
            return Err(StoreError::StateConflict {
                id: id.to_string(),
                actual: job.state,
                expected: expected.to_string(),
            });
        }
        let state = job.state;
        update(job);
        job.state = state;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn record_verdict(&self, verdict: EvaluationVerdict) -> StoreResult<SimulationJob> {
        let mut inner = self.inner.lock()?;
        let id = verdict.candidate_id.clone();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::JobNotFound { id: id.to_string() })?;
        if job.state != JobState::Succeeded {
            return Err(StoreError::VerdictWithoutSuccess {
                id: id.to_string(),
                state: job.state,
            });
        }
        job.verdict = Some(verdict);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn in_state(&self, state: JobState) -> StoreResult<Vec<SimulationJob>> {
        let inner = self.inner.lock()?;
        Ok(inner.sorted_jobs(inner.jobs.values().filter(|j| j.state == state)))
    }

    fn all(&self) -> StoreResult<Vec<SimulationJob>> {
        let inner = self.inner.lock()?;
        Ok(inner.sorted_jobs(inner.jobs.values()))
    }
}

impl SubmissionLedger for MemoryStateStore {
    fn claim(&self, id: &CandidateId) -> StoreResult<Claim> {
        let mut inner = self.inner.lock()?;
        let record = inner
            .submissions
            .entry(id.clone())
            .or_insert_with(|| SubmissionRecord::new(id.clone()));
        match record.state {
            SubmissionState::NotSubmitted => {
                record.state = SubmissionState::Submitting;
                record.updated_at = Utc::now();
                Ok(Claim::Claimed(record.clone()))
            }
            SubmissionState::Submitting => Ok(Claim::InProgress(record.clone())),
            SubmissionState::Submitted => Ok(Claim::AlreadySubmitted(record.clone())),
            SubmissionState::Failed => Ok(Claim::PreviouslyFailed(record.clone())),
        }
    }

    fn update_submission(
        &self,
        id: &CandidateId,
        next: SubmissionState,
        update: &mut dyn FnMut(&mut SubmissionRecord),
    ) -> StoreResult<SubmissionRecord> {
        let mut inner = self.inner.lock()?;
        let record = inner
            .submissions
            .get_mut(id)
            .ok_or_else(|| StoreError::SubmissionNotFound { id: id.to_string() })?;
        if record.state != SubmissionState::Submitting || next == SubmissionState::NotSubmitted {
            return Err(StoreError::SubmissionConflict {
                id: id.to_string(),
                actual: record.state,
                expected: SubmissionState::Submitting,
            });
        }
        update(record);
        record.state = next;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    fn release_interrupted(&self) -> StoreResult<Vec<SubmissionRecord>> {
        let mut inner = self.inner.lock()?;
        let mut released = Vec::new();
        for record in inner.submissions.values_mut() {
            if record.state == SubmissionState::Submitting {
                record.state = SubmissionState::NotSubmitted;
                record.last_error = Some(FailureRecord::new(
                    FailureKind::Interrupted,
                    "process stopped while submitting",
                ));
                record.updated_at = Utc::now();
                released.push(record.clone());
            }
        }
        Ok(released)
    }

    fn reset_failed(&self, id: &CandidateId) -> StoreResult<SubmissionRecord> {
        let mut inner = self.inner.lock()?;
        let record = inner
            .submissions
            .get_mut(id)
            .ok_or_else(|| StoreError::SubmissionNotFound { id: id.to_string() })?;
        if record.state != SubmissionState::Failed {
            return Err(StoreError::SubmissionConflict {
                id: id.to_string(),
                actual: record.state,
                expected: SubmissionState::Failed,
            });
        }
        record.state = SubmissionState::NotSubmitted;
        record.attempts = 0;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    fn get_submission(&self, id: &CandidateId) -> StoreResult<Option<SubmissionRecord>> {
        let inner = self.inner.lock()?;
        Ok(inner.submissions.get(id).cloned())
    }

    fn all_submissions(&self) -> StoreResult<Vec<SubmissionRecord>> {
        let inner = self.inner.lock()?;
        Ok(inner.submissions.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Candidate, SimulationSettings};

    fn job(expr: &str) -> SimulationJob {
        SimulationJob::queued(Candidate::new(expr, SimulationSettings::default(), "test"))
    }

    #[test]
    fn insert_assigns_increasing_seq() {
        let store = MemoryStateStore::new();
        let (a, _) = store.insert_if_absent(job("rank(close)")).unwrap();
        let (b, _) = store.insert_if_absent(job("rank(open)")).unwrap();
        assert!(a.seq < b.seq);
    }

    #[test]
    fn duplicate_insert_returns_existing() {
        let store = MemoryStateStore::new();
        let (first, inserted) = store.insert_if_absent(job("rank(close)")).unwrap();
        assert!(inserted);
        let (second, inserted) = store.insert_if_absent(job("rank( close )")).unwrap();
        assert!(!inserted);
        assert_eq!(first.seq, second.seq);
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[test]
    fn transition_sets_running_since() {
        let store = MemoryStateStore::new();
        let (j, _) = store.insert_if_absent(job("rank(close)")).unwrap();
        store
            .compare_and_transition(j.id(), &[JobState::Queued], JobState::Submitting, &mut |_| {})
            .unwrap();
        let running = store
            .compare_and_transition(j.id(), &[JobState::Submitting], JobState::Running, &mut |_| {})
            .unwrap();
        assert!(running.running_since.is_some());
    }

    #[test]
    fn verdict_requires_success() {
        let store = MemoryStateStore::new();
        let (j, _) = store.insert_if_absent(job("rank(close)")).unwrap();
        let verdict = EvaluationVerdict {
            candidate_id: j.id().clone(),
            accepted: true,
            reason: crate::job::ReasonCode::Accepted,
            metrics: Default::default(),
        };
        let err = store.record_verdict(verdict).unwrap_err();
        assert!(matches!(err, StoreError::VerdictWithoutSuccess { .. }));
    }

    #[test]
    fn claim_is_exclusive_until_failed_is_reset() {
        let store = MemoryStateStore::new();
        let id = job("rank(close)").id().clone();

        assert!(matches!(store.claim(&id).unwrap(), Claim::Claimed(_)));
        assert!(matches!(store.claim(&id).unwrap(), Claim::InProgress(_)));

        store
            .update_submission(&id, SubmissionState::Failed, &mut |r| r.attempts = 3)
            .unwrap();
        assert!(matches!(store.claim(&id).unwrap(), Claim::PreviouslyFailed(_)));

        let reset = store.reset_failed(&id).unwrap();
        assert_eq!(reset.state, SubmissionState::NotSubmitted);
        assert_eq!(reset.attempts, 0);
        assert!(matches!(store.claim(&id).unwrap(), Claim::Claimed(_)));
    }

    #[test]
    fn submitted_is_final() {
        let store = MemoryStateStore::new();
        let id = job("rank(close)").id().clone();
        store.claim(&id).unwrap();
        store
            .update_submission(&id, SubmissionState::Submitted, &mut |r| {
                r.confirmation_id = Some("A1".into())
            })
            .unwrap();

        assert!(matches!(store.claim(&id).unwrap(), Claim::AlreadySubmitted(_)));
        assert!(store
            .update_submission(&id, SubmissionState::Failed, &mut |_| {})
            .is_err());
        assert!(store.reset_failed(&id).is_err());
    }

    #[test]
    fn release_interrupted_reopens_submitting_records() {
        let store = MemoryStateStore::new();
        let id = job("rank(close)").id().clone();
        store.claim(&id).unwrap();

        let released = store.release_interrupted().unwrap();
        assert_eq!(released.len(), 1);
        let record = store.get_submission(&id).unwrap().unwrap();
        assert_eq!(record.state, SubmissionState::NotSubmitted);
        assert_eq!(
            record.last_error.map(|e| e.kind),
            Some(FailureKind::Interrupted)
        );
    }

    #[test]
    fn snapshot_restores_sequence_counter() {
        let store = MemoryStateStore::new();
        store.insert_if_absent(job("rank(close)")).unwrap();
        store.insert_if_absent(job("rank(open)")).unwrap();

        let restored = MemoryStateStore::from_snapshot(store.snapshot().unwrap()).unwrap();
        let (c, _) = restored.insert_if_absent(job("rank(volume)")).unwrap();
        assert_eq!(c.seq, 2);
    }
}
