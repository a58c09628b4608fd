//! Submission of accepted alphas for platform evaluation.
//!
//! The ledger decides ownership: only the caller that wins `claim` talks to
//! the platform, so a candidate is submitted at most once even when the
//! same completion is handled twice or two processes share a store.

use std::sync::Arc;

use alpha_state::{Claim, FailureRecord, JobState, SimulationJob, SubmissionLedger, SubmissionState};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument};

use crate::config::SubmissionConfig;
use crate::error::{AlphaError, Result};
use crate::gateway::{ConfirmationId, SimulationGateway};
use crate::metrics::METRICS;
use crate::obs;
use crate::orchestrator::StopHandle;
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryDecision, RetryPolicy};

/// What happened to one submission request.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Submitted(ConfirmationId),
    /// The job is not SUCCEEDED with an accepted verdict.
    NotAccepted,
    AlreadySubmitted,
    /// Another caller holds the claim.
    InProgress,
    /// A previous run failed terminally; needs an explicit reset.
    PreviouslyFailed,
    Failed(FailureRecord),
    /// Stopped while waiting to retry. The claim is released on the next
    /// ledger recovery.
    Interrupted,
}

impl SubmissionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SubmissionOutcome::Submitted(_) => "submitted",
            SubmissionOutcome::NotAccepted => "not_accepted",
            SubmissionOutcome::AlreadySubmitted => "already_submitted",
            SubmissionOutcome::InProgress => "in_progress",
            SubmissionOutcome::PreviouslyFailed => "previously_failed",
            SubmissionOutcome::Failed(_) => "failed",
            SubmissionOutcome::Interrupted => "interrupted",
        }
    }
}

pub struct SubmissionManager {
    ledger: Arc<dyn SubmissionLedger>,
    gateway: Arc<dyn SimulationGateway>,
    policy: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
    slots: Arc<Semaphore>,
}

impl SubmissionManager {
    pub fn new(
        ledger: Arc<dyn SubmissionLedger>,
        gateway: Arc<dyn SimulationGateway>,
        policy: RetryPolicy,
        config: &SubmissionConfig,
    ) -> Self {
        Self {
            ledger,
            gateway,
            policy,
            limiter: None,
            slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
        }
    }

    /// Draw submission requests from a shared limiter.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Submit an accepted job, retrying transient failures per the policy.
    #[instrument(skip_all, fields(candidate_id = %job.id().short()))]
    pub async fn submit(&self, job: &SimulationJob, stop: &StopHandle) -> Result<SubmissionOutcome> {
        let accepted = job.verdict.as_ref().is_some_and(|v| v.accepted);
        let result = match job.result.as_ref() {
            Some(result) if accepted && job.state == JobState::Succeeded => result,
            _ => return Ok(SubmissionOutcome::NotAccepted),
        };
        let id = job.id();

        match self.ledger.claim(id)? {
            Claim::Claimed(_) => {}
            Claim::InProgress(_) => return Ok(SubmissionOutcome::InProgress),
            Claim::AlreadySubmitted(record) => {
                debug!(confirmation = ?record.confirmation_id, "already submitted");
                return Ok(SubmissionOutcome::AlreadySubmitted);
            }
            Claim::PreviouslyFailed(_) => return Ok(SubmissionOutcome::PreviouslyFailed),
        }

        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|e| AlphaError::Worker(e.to_string()))?;
        let mut stop_rx = stop.signal();

        loop {
            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    biased;
                    _ = stop_rx.stopped() => return Ok(self.interrupted(job)),
                    _ = limiter.acquire() => {}
                }
            }

            METRICS.inc_submissions();
            match self.gateway.submit_for_evaluation(&job.candidate, result).await {
                Ok(confirmation) => {
                    let record = self.ledger.update_submission(id, SubmissionState::Submitted, &mut |r| {
                        r.attempts += 1;
                        r.confirmation_id = Some(confirmation.0.clone());
                        r.last_error = None;
                    })?;
                    info!(confirmation = %confirmation, "alpha submitted");
                    obs::emit_submission_finished(id, "submitted", record.attempts);
                    return Ok(SubmissionOutcome::Submitted(confirmation));
                }
                Err(e) => {
                    let failure = FailureRecord::new(e.kind(), e.to_string());
                    let record = self.ledger.update_submission(id, SubmissionState::Submitting, &mut |r| {
                        r.attempts += 1;
                        r.last_error = Some(failure.clone());
                    })?;

                    match self.policy.decide(e.kind(), record.attempts, e.retry_after()) {
                        RetryDecision::Retry { delay } => {
                            debug!(error = %e, attempts = record.attempts, delay_ms = delay.as_millis() as u64, "submission will retry");
                            tokio::select! {
                                biased;
                                _ = stop_rx.stopped() => return Ok(self.interrupted(job)),
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        RetryDecision::GiveUp(reason) => {
                            self.ledger
                                .update_submission(id, SubmissionState::Failed, &mut |_| {})?;
                            error!(error = %e, attempts = record.attempts, %reason, "submission failed");
                            obs::emit_submission_finished(id, "failed", record.attempts);
                            return Ok(SubmissionOutcome::Failed(failure));
                        }
                    }
                }
            }
        }
    }

    fn interrupted(&self, job: &SimulationJob) -> SubmissionOutcome {
        let attempts = self
            .ledger
            .get_submission(job.id())
            .ok()
            .flatten()
            .map(|r| r.attempts)
            .unwrap_or(0);
        obs::emit_submission_finished(job.id(), "interrupted", attempts);
        SubmissionOutcome::Interrupted
    }
}
