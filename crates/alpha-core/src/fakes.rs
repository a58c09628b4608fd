//! Scripted gateway fake (testing only)
//!
//! `ScriptedGateway` plays back per-candidate outcomes for submit, poll and
//! evaluation calls, and records every call so tests can assert on retry
//! counts, cancellations and peak in-flight concurrency.
//!
//! Unscripted calls succeed: submit returns a fresh handle, polls report
//! `Running` for the configured number of polls and then `Succeeded` with
//! the candidate's configured result, and evaluation returns the alpha id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use alpha_state::{Candidate, CandidateId, JobHandle, SimulationResult};
use async_trait::async_trait;

use crate::gateway::{CancelOutcome, ConfirmationId, GatewayError, PollStatus, SimulationGateway};

#[derive(Debug, Default)]
struct Script {
    submit: HashMap<CandidateId, VecDeque<Result<(), GatewayError>>>,
    polls: HashMap<CandidateId, VecDeque<Result<PollStatus, GatewayError>>>,
    evaluation: HashMap<CandidateId, VecDeque<Result<ConfirmationId, GatewayError>>>,
    results: HashMap<CandidateId, SimulationResult>,
    handles: HashMap<JobHandle, CandidateId>,
    polls_seen: HashMap<JobHandle, u32>,
    next_handle: u64,
    running_polls: u32,
    submit_latency: Duration,

    submit_calls: HashMap<CandidateId, u32>,
    poll_calls: u32,
    cancel_calls: Vec<JobHandle>,
    evaluation_calls: HashMap<CandidateId, u32>,
    in_flight: HashSet<CandidateId>,
    max_in_flight: usize,
}

/// Deterministic in-memory stand-in for the remote platform.
#[derive(Debug)]
pub struct ScriptedGateway {
    script: Mutex<Script>,
    supports_cancel: bool,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            supports_cancel: true,
        }
    }

    /// A gateway whose `cancel` is unsupported.
    pub fn without_cancel() -> Self {
        Self {
            supports_cancel: false,
            ..Self::new()
        }
    }

    /// Outcomes for successive `submit` calls for `candidate`.
    pub fn script_submit(&self, candidate: &Candidate, outcomes: Vec<Result<(), GatewayError>>) {
        self.script
            .lock()
            .unwrap()
            .submit
            .insert(candidate.id().clone(), outcomes.into());
    }

    /// Outcomes for successive polls of any handle issued for `candidate`.
    pub fn script_polls(
        &self,
        candidate: &Candidate,
        outcomes: Vec<Result<PollStatus, GatewayError>>,
    ) {
        self.script
            .lock()
            .unwrap()
            .polls
            .insert(candidate.id().clone(), outcomes.into());
    }

    /// Outcomes for successive `submit_for_evaluation` calls.
    pub fn script_evaluation(
        &self,
        candidate: &Candidate,
        outcomes: Vec<Result<ConfirmationId, GatewayError>>,
    ) {
        self.script
            .lock()
            .unwrap()
            .evaluation
            .insert(candidate.id().clone(), outcomes.into());
    }

    /// Result reported when an unscripted poll completes.
    pub fn set_result(&self, candidate: &Candidate, result: SimulationResult) {
        self.script
            .lock()
            .unwrap()
            .results
            .insert(candidate.id().clone(), result);
    }

    /// Unscripted polls report `Running` this many times before succeeding.
    pub fn set_running_polls(&self, polls: u32) {
        self.script.lock().unwrap().running_polls = polls;
    }

    /// Every `submit` call takes this long.
    pub fn set_submit_latency(&self, latency: Duration) {
        self.script.lock().unwrap().submit_latency = latency;
    }

    /// Make `handle` known as a job for `candidate`, as if submitted by an
    /// earlier process.
    pub fn register_handle(&self, candidate: &Candidate, handle: JobHandle) {
        self.script
            .lock()
            .unwrap()
            .handles
            .insert(handle, candidate.id().clone());
    }

    pub fn submit_calls(&self, candidate: &Candidate) -> u32 {
        let script = self.script.lock().unwrap();
        script.submit_calls.get(candidate.id()).copied().unwrap_or(0)
    }

    pub fn total_submit_calls(&self) -> u32 {
        self.script.lock().unwrap().submit_calls.values().sum()
    }

    pub fn poll_calls(&self) -> u32 {
        self.script.lock().unwrap().poll_calls
    }

    pub fn cancel_calls(&self) -> Vec<JobHandle> {
        self.script.lock().unwrap().cancel_calls.clone()
    }

    pub fn evaluation_calls(&self, candidate: &Candidate) -> u32 {
        let script = self.script.lock().unwrap();
        script
            .evaluation_calls
            .get(candidate.id())
            .copied()
            .unwrap_or(0)
    }

    /// Peak number of candidates between submit and a terminal poll/cancel.
    pub fn max_in_flight(&self) -> usize {
        self.script.lock().unwrap().max_in_flight
    }

    fn default_result(id: &CandidateId) -> SimulationResult {
        SimulationResult {
            alpha_id: Some(format!("alpha-{}", id.short())),
            ..SimulationResult::default()
        }
    }
}

#[async_trait]
impl SimulationGateway for ScriptedGateway {
    async fn submit(&self, candidate: &Candidate) -> Result<JobHandle, GatewayError> {
        let id = candidate.id().clone();
        let latency = {
            let mut script = self.script.lock().unwrap();
            *script.submit_calls.entry(id.clone()).or_default() += 1;
            script.in_flight.insert(id.clone());
            script.max_in_flight = script.max_in_flight.max(script.in_flight.len());
            script.submit_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut script = self.script.lock().unwrap();
        let outcome = script
            .submit
            .get_mut(&id)
            .and_then(|q| q.pop_front())
            .unwrap_or(Ok(()));
        match outcome {
            Ok(()) => {
                script.next_handle += 1;
                let handle = JobHandle(format!("sim/{}", script.next_handle));
                script.handles.insert(handle.clone(), id);
                Ok(handle)
            }
            Err(e) => {
                script.in_flight.remove(&id);
                Err(e)
            }
        }
    }

    async fn poll_status(&self, handle: &JobHandle) -> Result<PollStatus, GatewayError> {
        let mut script = self.script.lock().unwrap();
        script.poll_calls += 1;
        let id = match script.handles.get(handle) {
            Some(id) => id.clone(),
            None => return Ok(PollStatus::NotFound),
        };

        let running_polls = script.running_polls;
        let scripted = script.polls.get_mut(&id).and_then(|q| q.pop_front());
        let outcome = match scripted {
            Some(outcome) => outcome,
            None => {
                let seen = script.polls_seen.entry(handle.clone()).or_default();
                *seen += 1;
                if *seen <= running_polls {
                    Ok(PollStatus::Running { retry_after: None })
                } else {
                    let result = script
                        .results
                        .get(&id)
                        .cloned()
                        .unwrap_or_else(|| Self::default_result(&id));
                    Ok(PollStatus::Succeeded(result))
                }
            }
        };

        if matches!(
            outcome,
            Ok(PollStatus::Succeeded(_)) | Ok(PollStatus::Failed(_)) | Ok(PollStatus::NotFound)
        ) {
            script.in_flight.remove(&id);
        }
        outcome
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<CancelOutcome, GatewayError> {
        let mut script = self.script.lock().unwrap();
        script.cancel_calls.push(handle.clone());
        let known = script.handles.get(handle).cloned();
        match known {
            Some(id) if script.in_flight.remove(&id) => Ok(CancelOutcome::Cancelled),
            _ => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    async fn submit_for_evaluation(
        &self,
        candidate: &Candidate,
        result: &SimulationResult,
    ) -> Result<ConfirmationId, GatewayError> {
        let id = candidate.id().clone();
        let mut script = self.script.lock().unwrap();
        *script.evaluation_calls.entry(id.clone()).or_default() += 1;
        let scripted = script.evaluation.get_mut(&id).and_then(|q| q.pop_front());
        match scripted {
            Some(outcome) => outcome,
            None => result
                .alpha_id
                .clone()
                .map(ConfirmationId)
                .ok_or_else(|| GatewayError::Rejected("result has no alpha id".into())),
        }
    }

    fn supports_cancel(&self) -> bool {
        self.supports_cancel
    }
}
