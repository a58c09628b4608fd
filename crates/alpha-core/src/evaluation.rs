//! Accept/reject decisions for completed simulations.
//!
//! Evaluation is a pure function of the job's result and the thresholds: no
//! I/O, no clock, no randomness. Re-evaluating the same job always yields the
//! same verdict.

use alpha_state::{EvaluationVerdict, JobState, ReasonCode, SimulationJob};
use serde::{Deserialize, Serialize};

use crate::error::EvaluationError;

/// Acceptance thresholds. Unset thresholds are not checked.
///
/// Checks run in a fixed order (sharpe, fitness, max turnover, min
/// turnover, information ratio, platform checks) and the first failure
/// becomes the verdict's reason.
///
/// In config files a threshold is a number, or `false` / `"off"` to switch
/// off one that is on by default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    #[serde(with = "switchable")]
    pub min_sharpe: Option<f64>,
    #[serde(with = "switchable")]
    pub min_fitness: Option<f64>,
    #[serde(with = "switchable")]
    pub max_turnover: Option<f64>,
    #[serde(with = "switchable")]
    pub min_turnover: Option<f64>,
    #[serde(with = "switchable")]
    pub min_information_ratio: Option<f64>,
    /// Reject when any platform check reports FAIL.
    pub require_passing_checks: bool,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_sharpe: Some(1.25),
            min_fitness: Some(1.0),
            max_turnover: Some(0.7),
            min_turnover: Some(0.01),
            min_information_ratio: None,
            require_passing_checks: false,
        }
    }
}

impl Thresholds {
    /// No thresholds at all: every completed simulation is accepted.
    pub fn none() -> Self {
        Self {
            min_sharpe: None,
            min_fitness: None,
            max_turnover: None,
            min_turnover: None,
            min_information_ratio: None,
            require_passing_checks: false,
        }
    }
}

/// Serde form of an optional threshold. `None` is written as `false` so it
/// survives formats without a null, such as TOML.
mod switchable {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Value(f64),
        Flag(bool),
        Word(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_f64(*v),
            None => serializer.serialize_bool(false),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            None | Some(Raw::Flag(false)) => Ok(None),
            Some(Raw::Value(v)) => Ok(Some(v)),
            Some(Raw::Word(w)) if w.eq_ignore_ascii_case("off") => Ok(None),
            Some(Raw::Flag(true)) => Err(D::Error::custom("a threshold must be a number, false or \"off\"")),
            Some(Raw::Word(w)) => Err(D::Error::custom(format!(
                "unknown threshold {w:?}, expected a number, false or \"off\""
            ))),
        }
    }
}

enum Bound {
    Min,
    Max,
}

fn check(
    name: &str,
    value: Option<f64>,
    threshold: Option<f64>,
    bound: Bound,
    reason: ReasonCode,
) -> Option<ReasonCode> {
    let threshold = threshold?;
    let value = match value.filter(|v| v.is_finite()) {
        Some(v) => v,
        None => return Some(ReasonCode::MetricMissing(name.to_string())),
    };
    let failed = match bound {
        Bound::Min => value < threshold,
        Bound::Max => value > threshold,
    };
    failed.then_some(reason)
}

/// Evaluate a SUCCEEDED job against `thresholds`.
pub fn evaluate(
    job: &SimulationJob,
    thresholds: &Thresholds,
) -> Result<EvaluationVerdict, EvaluationError> {
    if job.state != JobState::Succeeded {
        return Err(EvaluationError::NotSucceeded {
            id: job.id().to_string(),
            state: job.state.to_string(),
        });
    }
    let result = job
        .result
        .as_ref()
        .ok_or_else(|| EvaluationError::MissingResult {
            id: job.id().to_string(),
        })?;
    let m = &result.metrics;

    let failure = check(
        "sharpe",
        m.sharpe,
        thresholds.min_sharpe,
        Bound::Min,
        ReasonCode::SharpeBelowThreshold,
    )
    .or_else(|| {
        check(
            "fitness",
            m.fitness,
            thresholds.min_fitness,
            Bound::Min,
            ReasonCode::FitnessBelowThreshold,
        )
    })
    .or_else(|| {
        check(
            "turnover",
            m.turnover,
            thresholds.max_turnover,
            Bound::Max,
            ReasonCode::TurnoverAboveThreshold,
        )
    })
    .or_else(|| {
        check(
            "turnover",
            m.turnover,
            thresholds.min_turnover,
            Bound::Min,
            ReasonCode::TurnoverBelowThreshold,
        )
    })
    .or_else(|| {
        check(
            "information ratio",
            m.information_ratio,
            thresholds.min_information_ratio,
            Bound::Min,
            ReasonCode::InformationRatioBelowThreshold,
        )
    })
    .or_else(|| {
        if !thresholds.require_passing_checks {
            return None;
        }
        result
            .checks
            .iter()
            .find(|c| !c.passed())
            .map(|c| ReasonCode::CheckFailed(c.name.clone()))
    });

    Ok(EvaluationVerdict {
        candidate_id: job.id().clone(),
        accepted: failure.is_none(),
        reason: failure.unwrap_or(ReasonCode::Accepted),
        metrics: m.clone(),
    })
}
