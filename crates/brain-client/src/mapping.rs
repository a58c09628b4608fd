//! Translation between platform HTTP responses and gateway types.
//!
//! Everything here is pure so the status and payload handling can be tested
//! without a server.

use std::time::Duration;

use alpha_core::GatewayError;
use alpha_state::{AlphaCheck, Candidate, MetricsSnapshot, SimulationResult};
use serde::Deserialize;
use serde_json::{json, Value};

const BODY_SNIPPET_CHARS: usize = 200;

/// Which API a failing response came from. Some statuses mean different
/// things on the submission endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Simulation,
    Submission,
}

/// Progress of a simulation as read from its progress URL.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Running(Option<Duration>),
    Complete { alpha_id: String },
    Failed(String),
    NotFound,
}

/// State of a submission check.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionCheck {
    Pending(Option<Duration>),
    Passed,
    /// Names of the checks that reported FAIL.
    Failed(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct ProgressBody {
    status: Option<String>,
    alpha: Option<String>,
    message: Option<String>,
}

/// Body for `POST /simulations`.
pub fn simulation_request(candidate: &Candidate) -> Value {
    json!({
        "type": "REGULAR",
        "settings": candidate.settings(),
        "regular": candidate.expression(),
    })
}

/// `Retry-After` in (possibly fractional) seconds.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let secs: f64 = value?.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Cookie header value carrying the session set by a login response.
pub fn session_cookie<'a>(set_cookie: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let pairs: Vec<&str> = set_cookie
        .into_iter()
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|p| p.contains('='))
        .collect();
    (!pairs.is_empty()).then(|| pairs.join("; "))
}

pub fn snippet(body: &str) -> String {
    body.trim().chars().take(BODY_SNIPPET_CHARS).collect()
}

/// Map an unsuccessful status to a gateway error.
pub fn classify_error(
    endpoint: Endpoint,
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> GatewayError {
    let detail = snippet(body);
    match (status, endpoint) {
        (429, _) => GatewayError::RateLimited { retry_after },
        (401, _) => GatewayError::Auth(format!("status 401: {detail}")),
        (403, Endpoint::Simulation) => GatewayError::Auth(format!("status 403: {detail}")),
        (403 | 404 | 409, Endpoint::Submission) => GatewayError::Rejected(format!("status {status}: {detail}")),
        (400 | 422, _) => GatewayError::Rejected(detail),
        (500..=599, _) => GatewayError::Transport(format!("server error {status}: {detail}")),
        _ => GatewayError::Transport(format!("unexpected status {status}: {detail}")),
    }
}

/// Interpret a response from a simulation progress URL.
pub fn interpret_progress(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> Result<Progress, GatewayError> {
    match status {
        404 | 410 => return Ok(Progress::NotFound),
        202 | 204 => return Ok(Progress::Running(retry_after)),
        200 | 201 => {}
        _ => return Err(classify_error(Endpoint::Simulation, status, retry_after, body)),
    }
    if body.trim().is_empty() {
        return Ok(Progress::Running(retry_after));
    }

    let parsed: ProgressBody = serde_json::from_str(body)
        .map_err(|e| GatewayError::Transport(format!("unreadable progress body: {e}")))?;
    match parsed.status.as_deref() {
        Some("COMPLETE") | Some("WARNING") => match parsed.alpha {
            Some(alpha_id) if !alpha_id.is_empty() => Ok(Progress::Complete { alpha_id }),
            _ => Ok(Progress::Failed("simulation completed without an alpha id".into())),
        },
        Some(s @ ("FAILED" | "ERROR" | "FAIL")) => {
            let message = match parsed.message {
                Some(m) => format!("simulation {s}: {m}"),
                None => format!("simulation {s}"),
            };
            Ok(Progress::Failed(message))
        }
        _ => Ok(Progress::Running(retry_after)),
    }
}

fn check(value: &Value) -> Option<AlphaCheck> {
    Some(AlphaCheck {
        name: value.get("name")?.as_str()?.to_string(),
        result: value
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        limit: value.get("limit").and_then(Value::as_f64),
        value: value.get("value").and_then(Value::as_f64),
    })
}

fn checks(in_sample: &Value) -> Vec<AlphaCheck> {
    in_sample
        .get("checks")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(check).collect())
        .unwrap_or_default()
}

/// Build a simulation result from `GET /alphas/{id}`.
pub fn alpha_result(alpha_id: &str, raw: Value) -> SimulationResult {
    let in_sample = raw.get("is").cloned().unwrap_or(Value::Null);
    let num = |key: &str| in_sample.get(key).and_then(Value::as_f64);
    let count = |key: &str| in_sample.get(key).and_then(Value::as_u64);

    SimulationResult {
        alpha_id: Some(alpha_id.to_string()),
        metrics: MetricsSnapshot {
            sharpe: num("sharpe"),
            fitness: num("fitness"),
            turnover: num("turnover"),
            returns: num("returns"),
            drawdown: num("drawdown"),
            margin: num("margin"),
            information_ratio: num("informationRatio"),
            long_count: count("longCount"),
            short_count: count("shortCount"),
        },
        checks: checks(&in_sample),
        raw,
    }
}

/// Body for `PATCH /alphas/{id}` that replaces the alpha's tags.
pub fn tags_patch(tags: &[&str]) -> Value {
    json!({ "tags": tags })
}

/// Interpret a response from `GET /alphas/{id}/submit`.
pub fn interpret_submission_check(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> Result<SubmissionCheck, GatewayError> {
    if retry_after.is_some() && status != 429 {
        return Ok(SubmissionCheck::Pending(retry_after));
    }
    match status {
        202 | 204 => return Ok(SubmissionCheck::Pending(None)),
        200 | 201 => {}
        _ => return Err(classify_error(Endpoint::Submission, status, retry_after, body)),
    }
    if body.trim().is_empty() {
        return Ok(SubmissionCheck::Passed);
    }

    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| GatewayError::Transport(format!("unreadable submission body: {e}")))?;
    let in_sample = parsed.get("is").cloned().unwrap_or(Value::Null);
    let failed: Vec<String> = checks(&in_sample)
        .into_iter()
        .filter(|c| !c.passed())
        .map(|c| c.name)
        .collect();
    if failed.is_empty() {
        Ok(SubmissionCheck::Passed)
    } else {
        Ok(SubmissionCheck::Failed(failed))
    }
}
