//! Startup recovery of jobs left in flight by an earlier process.
//!
//! Nothing is resubmitted here. A SUBMITTING job without a handle may or may
//! not have reached the platform, so it is failed as interrupted and left to
//! the retry policy. Jobs holding a handle are polled once: finished ones
//! are ingested, still-running ones are handed back for normal polling.

use alpha_state::{FailureKind, FailureRecord, JobState, JobStateStore, SimulationJob};
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::gateway::{PollStatus, SimulationGateway};
use crate::obs;

/// Jobs sorted into what the scheduler should do with them.
#[derive(Debug, Default)]
pub struct Recovery {
    /// QUEUED and RETRYING jobs, in enqueue order.
    pub ready: Vec<SimulationJob>,
    /// RUNNING jobs whose remote simulation is still going.
    pub resume: Vec<SimulationJob>,
    /// Jobs found finished remotely and moved to SUCCEEDED.
    pub ingested: Vec<SimulationJob>,
    /// FAILED jobs still awaiting a retry decision.
    pub failed: Vec<SimulationJob>,
}

impl Recovery {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
            && self.resume.is_empty()
            && self.ingested.is_empty()
            && self.failed.is_empty()
    }
}

#[instrument(skip_all)]
pub async fn reconcile(
    store: &dyn JobStateStore,
    gateway: &dyn SimulationGateway,
) -> Result<Recovery> {
    let mut recovery = Recovery::default();

    for job in store.in_state(JobState::Submitting)? {
        if job.handle.is_some() {
            store.compare_and_transition(job.id(), &[JobState::Submitting], JobState::Running, &mut |_| {})?;
            obs::emit_job_transition(job.id(), JobState::Submitting, JobState::Running, job.attempts);
        } else {
            store.compare_and_transition(job.id(), &[JobState::Submitting], JobState::Failed, &mut |j| {
                j.last_error = Some(FailureRecord::new(
                    FailureKind::Interrupted,
                    "process stopped while submitting",
                ))
            })?;
            obs::emit_job_transition(job.id(), JobState::Submitting, JobState::Failed, job.attempts);
        }
    }

    for job in store.in_state(JobState::Running)? {
        let Some(handle) = job.handle.clone() else {
            warn!(candidate_id = %job.id().short(), "running job without handle");
            fail(store, &job, FailureRecord::new(FailureKind::Interrupted, "no remote handle"))?;
            continue;
        };
        match gateway.poll_status(&handle).await {
            Ok(PollStatus::Running { .. }) => recovery.resume.push(job),
            Ok(PollStatus::Succeeded(result)) => {
                let mut result = Some(result);
                let job = store.compare_and_transition(
                    job.id(),
                    &[JobState::Running],
                    JobState::Succeeded,
                    &mut |j| j.result = result.take(),
                )?;
                obs::emit_job_transition(job.id(), JobState::Running, JobState::Succeeded, job.attempts);
                recovery.ingested.push(job);
            }
            Ok(PollStatus::Failed(message)) => {
                fail(store, &job, FailureRecord::new(FailureKind::RemoteFailed, message))?;
            }
            Ok(PollStatus::NotFound) => {
                fail(
                    store,
                    &job,
                    FailureRecord::new(FailureKind::NotFound, format!("handle {handle} unknown")),
                )?;
            }
            Err(e) if e.kind().is_retryable() => {
                warn!(handle = %handle, error = %e, "recovery poll failed, resuming");
                recovery.resume.push(job);
            }
            Err(e) => fail(store, &job, FailureRecord::new(e.kind(), e.to_string()))?,
        }
    }

    recovery.failed = store
        .in_state(JobState::Failed)?
        .into_iter()
        .filter(|j| !j.retries_exhausted)
        .collect();

    let mut ready = store.in_state(JobState::Queued)?;
    ready.extend(store.in_state(JobState::Retrying)?);
    ready.sort_by_key(|j| j.seq);
    recovery.ready = ready;

    if !recovery.is_empty() {
        info!(
            ready = recovery.ready.len(),
            resume = recovery.resume.len(),
            ingested = recovery.ingested.len(),
            failed = recovery.failed.len(),
            "recovered jobs from previous run"
        );
    }
    Ok(recovery)
}

fn fail(store: &dyn JobStateStore, job: &SimulationJob, failure: FailureRecord) -> Result<()> {
    store.compare_and_transition(job.id(), &[JobState::Running], JobState::Failed, &mut |j| {
        j.last_error = Some(failure.clone())
    })?;
    obs::emit_job_transition(job.id(), JobState::Running, JobState::Failed, job.attempts);
    Ok(())
}
