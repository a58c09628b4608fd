//! Retry and polling delay policies.
//!
//! One `RetryPolicy` is shared by the simulation and submission paths so a
//! given failure class gets the same treatment wherever it occurs.

use std::time::Duration;

use alpha_state::FailureKind;
use rand::Rng;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`.
    Retry { delay: Duration },
    /// Stop retrying.
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The failure class is never worth retrying.
    NotRetryable,
    /// `max_attempts` reached.
    Exhausted,
}

impl std::fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GiveUpReason::NotRetryable => write!(f, "not retryable"),
            GiveUpReason::Exhausted => write!(f, "retries exhausted"),
        }
    }
}

/// Exponential backoff with proportional jitter and a cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter as a fraction of the computed delay (0.1 = +/-10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Same policy with jitter disabled.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before the next attempt, given how many attempts have been made.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        let raw = self.base_delay.saturating_mul(2u32.saturating_pow(exp));
        jittered(raw.min(self.max_delay), self.jitter).min(self.max_delay)
    }

    /// Decide whether a failure after `attempts` attempts gets another try.
    ///
    /// A server wait hint lengthens the delay but never shortens it.
    pub fn decide(
        &self,
        kind: FailureKind,
        attempts: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::GiveUp(GiveUpReason::NotRetryable);
        }
        if attempts >= self.max_attempts {
            return RetryDecision::GiveUp(GiveUpReason::Exhausted);
        }
        let delay = match retry_after {
            Some(hint) => hint.max(self.backoff(attempts)),
            None => self.backoff(attempts),
        };
        RetryDecision::Retry { delay }
    }
}

/// Delay schedule for polling a running simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSchedule {
    pub base: Duration,
    pub max: Duration,
    pub growth: f64,
    pub jitter: f64,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(30),
            growth: 1.5,
            jitter: 0.1,
        }
    }
}

impl PollSchedule {
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before poll number `polls` (0-based). A platform hint replaces
    /// the computed delay, clamped to `max`.
    pub fn delay(&self, polls: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max);
        }
        let factor = self.growth.powi(polls.min(64) as i32);
        let raw = self.base.as_secs_f64() * factor;
        let capped = Duration::from_secs_f64(raw.min(self.max.as_secs_f64()));
        jittered(capped, self.jitter).min(self.max)
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let spread = delay.as_secs_f64() * jitter;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}
