//! Trait contract tests for JobStateStore and SubmissionLedger.
//!
//! Every contract runs against both the in-memory store and the
//! snapshot-backed store. Any conforming implementation must pass these.

use std::sync::{Arc, Barrier};
use std::thread;

use alpha_state::storage_traits::*;
use alpha_state::{
    Candidate, EvaluationVerdict, FailureKind, FailureRecord, FileStateStore, JobState,
    MemoryStateStore, MetricsSnapshot, ReasonCode, SimulationJob, SimulationSettings, StoreError,
    SubmissionState,
};

trait Store: JobStateStore + SubmissionLedger + 'static {}
impl<T: JobStateStore + SubmissionLedger + 'static> Store for T {}

fn stores() -> Vec<(&'static str, Arc<dyn Store>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let file = FileStateStore::open(dir.path().join("state.json")).unwrap();
    vec![
        ("memory", Arc::new(MemoryStateStore::new()), None),
        ("file", Arc::new(file), Some(dir)),
    ]
}

fn candidate(expr: &str) -> Candidate {
    Candidate::new(expr, SimulationSettings::default(), "contract")
}

fn advance(store: &dyn Store, job: &SimulationJob, path: &[JobState]) {
    let mut current = job.state;
    for &next in path {
        store
            .compare_and_transition(job.id(), &[current], next, &mut |_| {})
            .unwrap();
        current = next;
    }
}

// ===========================================================================
// JobStateStore contract tests
// ===========================================================================

#[test]
fn insert_deduplicates_by_content_identity() {
    for (name, store, _dir) in stores() {
        let (_, first) = store
            .insert_if_absent(SimulationJob::queued(candidate("rank(close)")))
            .unwrap();
        let (_, second) = store
            .insert_if_absent(SimulationJob::queued(candidate("rank ( close )")))
            .unwrap();

        assert!(first, "{name}");
        assert!(!second, "{name}");
        assert_eq!(store.all().unwrap().len(), 1, "{name}");
    }
}

#[test]
fn all_returns_enqueue_order() {
    for (name, store, _dir) in stores() {
        for expr in ["rank(a)", "rank(b)", "rank(c)"] {
            store
                .insert_if_absent(SimulationJob::queued(candidate(expr)))
                .unwrap();
        }
        let exprs: Vec<String> = store
            .all()
            .unwrap()
            .iter()
            .map(|j| j.candidate.expression().to_string())
            .collect();
        assert_eq!(exprs, vec!["rank(a)", "rank(b)", "rank(c)"], "{name}");
    }
}

#[test]
fn transition_from_wrong_state_conflicts() {
    for (name, store, _dir) in stores() {
        let (job, _) = store
            .insert_if_absent(SimulationJob::queued(candidate("rank(close)")))
            .unwrap();
        let err = store
            .compare_and_transition(job.id(), &[JobState::Running], JobState::Succeeded, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, StoreError::StateConflict { .. }), "{name}");
    }
}

#[test]
fn transition_outside_lifecycle_is_illegal() {
    for (name, store, _dir) in stores() {
        let (job, _) = store
            .insert_if_absent(SimulationJob::queued(candidate("rank(close)")))
            .unwrap();
        let err = store
            .compare_and_transition(job.id(), &[JobState::Queued], JobState::Running, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }), "{name}");
        assert_eq!(
            store.get(job.id()).unwrap().unwrap().state,
            JobState::Queued,
            "{name}"
        );
    }
}

#[test]
fn terminal_states_are_final() {
    for (name, store, _dir) in stores() {
        let (job, _) = store
            .insert_if_absent(SimulationJob::queued(candidate("rank(close)")))
            .unwrap();
        advance(
            store.as_ref(),
            &job,
            &[JobState::Submitting, JobState::Running, JobState::Succeeded],
        );
        for next in [
            JobState::Queued,
            JobState::Submitting,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert!(
                store
                    .compare_and_transition(job.id(), &[JobState::Succeeded], next, &mut |_| {})
                    .is_err(),
                "{name}: SUCCEEDED -> {next}"
            );
        }
    }
}

#[test]
fn unknown_job_is_not_found() {
    for (name, store, _dir) in stores() {
        let id = candidate("rank(nowhere)").id().clone();
        let err = store
            .compare_and_transition(&id, &[JobState::Queued], JobState::Submitting, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound { .. }), "{name}");
        assert!(store.get(&id).unwrap().is_none(), "{name}");
    }
}

#[test]
fn racing_transitions_have_one_winner() {
    for (name, store, _dir) in stores() {
        let (job, _) = store
            .insert_if_absent(SimulationJob::queued(candidate("rank(close)")))
            .unwrap();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let id = job.id().clone();
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .compare_and_transition(&id, &[JobState::Queued], JobState::Submitting, &mut |j| {
                            j.attempts += 1
                        })
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1, "{name}");
        assert_eq!(store.get(job.id()).unwrap().unwrap().attempts, 1, "{name}");
    }
}

#[test]
fn retry_path_returns_to_submitting() {
    for (name, store, _dir) in stores() {
        let (job, _) = store
            .insert_if_absent(SimulationJob::queued(candidate("rank(close)")))
            .unwrap();
        advance(store.as_ref(), &job, &[JobState::Submitting]);
        store
            .compare_and_transition(job.id(), &[JobState::Submitting], JobState::Failed, &mut |j| {
                j.last_error = Some(FailureRecord::new(FailureKind::Transport, "reset"))
            })
            .unwrap();
        advance(
            store.as_ref(),
            &store.get(job.id()).unwrap().unwrap(),
            &[JobState::Retrying, JobState::Submitting],
        );
        let current = store.get(job.id()).unwrap().unwrap();
        assert_eq!(current.state, JobState::Submitting, "{name}");
        assert_eq!(
            current.last_error.map(|e| e.kind),
            Some(FailureKind::Transport),
            "{name}"
        );
    }
}

#[test]
fn update_in_place_keeps_state() {
    for (name, store, _dir) in stores() {
        let (job, _) = store
            .insert_if_absent(SimulationJob::queued(candidate("rank(close)")))
            .unwrap();
        advance(store.as_ref(), &job, &[JobState::Submitting, JobState::Failed]);
        let updated = store
            .update_in_place(job.id(), JobState::Failed, &mut |j| j.retries_exhausted = true)
            .unwrap();
        assert_eq!(updated.state, JobState::Failed, "{name}");
        assert!(updated.is_settled(), "{name}");
    }
}

#[test]
fn verdict_only_on_succeeded() {
    for (name, store, _dir) in stores() {
        let (job, _) = store
            .insert_if_absent(SimulationJob::queued(candidate("rank(close)")))
            .unwrap();
        let verdict = EvaluationVerdict {
            candidate_id: job.id().clone(),
            accepted: false,
            reason: ReasonCode::SharpeBelowThreshold,
            metrics: MetricsSnapshot::default(),
        };
        assert!(store.record_verdict(verdict.clone()).is_err(), "{name}");

        advance(
            store.as_ref(),
            &job,
            &[JobState::Submitting, JobState::Running, JobState::Succeeded],
        );
        let stored = store.record_verdict(verdict).unwrap();
        assert_eq!(
            stored.verdict.map(|v| v.reason),
            Some(ReasonCode::SharpeBelowThreshold),
            "{name}"
        );
    }
}

#[test]
fn in_state_filters() {
    for (name, store, _dir) in stores() {
        let (a, _) = store
            .insert_if_absent(SimulationJob::queued(candidate("rank(a)")))
            .unwrap();
        store
            .insert_if_absent(SimulationJob::queued(candidate("rank(b)")))
            .unwrap();
        advance(store.as_ref(), &a, &[JobState::Cancelled]);

        assert_eq!(store.in_state(JobState::Queued).unwrap().len(), 1, "{name}");
        assert_eq!(store.in_state(JobState::Cancelled).unwrap().len(), 1, "{name}");
        assert!(store.in_state(JobState::Running).unwrap().is_empty(), "{name}");
    }
}

// ===========================================================================
// SubmissionLedger contract tests
// ===========================================================================

#[test]
fn concurrent_claims_have_one_owner() {
    for (name, store, _dir) in stores() {
        let id = candidate("rank(close)").id().clone();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let id = id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    matches!(store.claim(&id).unwrap(), Claim::Claimed(_))
                })
            })
            .collect();
        let owners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|owned| *owned)
            .count();
        assert_eq!(owners, 1, "{name}");
    }
}

#[test]
fn submitted_record_is_never_reclaimed() {
    for (name, store, _dir) in stores() {
        let id = candidate("rank(close)").id().clone();
        store.claim(&id).unwrap();
        store
            .update_submission(&id, SubmissionState::Submitted, &mut |r| {
                r.attempts = 1;
                r.confirmation_id = Some("ALPHA1".into());
            })
            .unwrap();

        match store.claim(&id).unwrap() {
            Claim::AlreadySubmitted(record) => {
                assert_eq!(record.confirmation_id.as_deref(), Some("ALPHA1"), "{name}")
            }
            other => panic!("{name}: unexpected claim {other:?}"),
        }
    }
}

#[test]
fn update_requires_submitting() {
    for (name, store, _dir) in stores() {
        let id = candidate("rank(close)").id().clone();
        assert!(matches!(
            store
                .update_submission(&id, SubmissionState::Submitted, &mut |_| {})
                .unwrap_err(),
            StoreError::SubmissionNotFound { .. }
        ), "{name}");

        store.claim(&id).unwrap();
        store
            .update_submission(&id, SubmissionState::Failed, &mut |_| {})
            .unwrap();
        assert!(matches!(
            store
                .update_submission(&id, SubmissionState::Submitted, &mut |_| {})
                .unwrap_err(),
            StoreError::SubmissionConflict { .. }
        ), "{name}");
    }
}

#[test]
fn reset_failed_reopens_for_claim() {
    for (name, store, _dir) in stores() {
        let id = candidate("rank(close)").id().clone();
        store.claim(&id).unwrap();
        store
            .update_submission(&id, SubmissionState::Failed, &mut |r| r.attempts = 3)
            .unwrap();
        assert!(
            matches!(store.claim(&id).unwrap(), Claim::PreviouslyFailed(_)),
            "{name}"
        );

        store.reset_failed(&id).unwrap();
        assert!(matches!(store.claim(&id).unwrap(), Claim::Claimed(_)), "{name}");
    }
}

#[test]
fn file_store_persists_ledger_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let id = candidate("rank(close)").id().clone();
    {
        let store = FileStateStore::open(&path).unwrap();
        store.claim(&id).unwrap();
        store
            .update_submission(&id, SubmissionState::Submitted, &mut |r| {
                r.confirmation_id = Some("ALPHA1".into())
            })
            .unwrap();
    }
    let store = FileStateStore::open(&path).unwrap();
    assert!(matches!(
        store.claim(&id).unwrap(),
        Claim::AlreadySubmitted(_)
    ));
}
