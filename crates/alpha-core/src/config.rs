//! Tunables for scheduling, retries, submission and evaluation.
//!
//! Every struct deserializes with defaults for missing fields, so a config
//! file only needs to name what it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AlphaError, Result};
use crate::evaluation::Thresholds;
use crate::retry::{PollSchedule, RetryPolicy};

/// Simulation scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on jobs in SUBMITTING or RUNNING.
    pub max_concurrent: usize,
    /// Attempts per job, including the first.
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Fraction of each delay used as +/- jitter.
    pub retry_jitter: f64,
    pub poll_base_ms: u64,
    pub poll_max_ms: u64,
    pub poll_jitter: f64,
    /// Wall-clock ceiling for one RUNNING attempt.
    pub job_timeout_ms: u64,
    /// Token refill rate for new submissions.
    pub requests_per_minute: u32,
    /// Token bucket capacity.
    pub burst: u32,
    /// Capacity of the completion channel to the evaluation stage.
    pub completion_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_attempts: 3,
            retry_base_ms: 5_000,
            retry_max_ms: 60_000,
            retry_jitter: 0.1,
            poll_base_ms: 5_000,
            poll_max_ms: 30_000,
            poll_jitter: 0.1,
            job_timeout_ms: 30 * 60 * 1_000,
            requests_per_minute: 30,
            burst: 5,
            completion_buffer: 64,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(AlphaError::InvalidConfig(
                "max_concurrent must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(AlphaError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.requests_per_minute == 0 || self.burst == 0 {
            return Err(AlphaError::InvalidConfig(
                "requests_per_minute and burst must be positive".into(),
            ));
        }
        if self.retry_base_ms > self.retry_max_ms || self.poll_base_ms > self.poll_max_ms {
            return Err(AlphaError::InvalidConfig(
                "base delays must not exceed their caps".into(),
            ));
        }
        for (name, jitter) in [("retry_jitter", self.retry_jitter), ("poll_jitter", self.poll_jitter)] {
            if !(0.0..1.0).contains(&jitter) {
                return Err(AlphaError::InvalidConfig(format!("{name} must be in [0, 1)")));
            }
        }
        if self.completion_buffer == 0 {
            return Err(AlphaError::InvalidConfig(
                "completion_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            jitter: self.retry_jitter,
        }
    }

    pub fn poll_schedule(&self) -> PollSchedule {
        PollSchedule {
            base: Duration::from_millis(self.poll_base_ms),
            max: Duration::from_millis(self.poll_max_ms),
            growth: 1.5,
            jitter: self.poll_jitter,
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

/// Submission stage configuration. Retries use the orchestrator's policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Upper bound on concurrent submissions.
    pub max_concurrent: usize,
    /// Skip the submission stage entirely (evaluate only).
    pub dry_run: bool,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            dry_run: false,
        }
    }
}

/// Everything a pipeline run needs, as loaded from a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub orchestrator: OrchestratorConfig,
    pub submission: SubmissionConfig,
    pub thresholds: Thresholds,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.orchestrator.validate()?;
        if self.submission.max_concurrent == 0 {
            return Err(AlphaError::InvalidConfig(
                "submission.max_concurrent must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
