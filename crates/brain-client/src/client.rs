//! Session-authenticated HTTP client for the platform API.

use std::time::Duration;

use alpha_core::{CancelOutcome, ConfirmationId, GatewayError, PollStatus, SimulationGateway};
use alpha_state::{Candidate, JobHandle, SimulationResult};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, COOKIE, LOCATION, RETRY_AFTER, SET_COOKIE};
use reqwest::Method;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::BrainConfig;
use crate::error::BrainError;
use crate::mapping::{self, Endpoint, Progress, SubmissionCheck};
use crate::Result;

const AUTH_PATH: &str = "/authentication";
const SIMULATIONS_PATH: &str = "/simulations";
const ALPHAS_PATH: &str = "/alphas";

/// Parts of a response the gateway cares about.
struct Reply {
    status: u16,
    retry_after: Option<Duration>,
    location: Option<String>,
    body: String,
}

/// Platform client implementing [`SimulationGateway`].
///
/// Logs in lazily on first use and once more whenever a request comes back
/// 401.
pub struct BrainClient {
    config: BrainConfig,
    http: reqwest::Client,
    /// Cookie header for the current session. `Some("")` means logged in
    /// without a cookie.
    session: RwLock<Option<String>>,
}

impl BrainClient {
    pub fn new(config: BrainConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("brain-client/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            config,
            http,
            session: RwLock::new(None),
        })
    }

    /// Create a client from `WQ_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(BrainConfig::from_env()?)
    }

    pub fn config(&self) -> &BrainConfig {
        &self.config
    }

    /// Authenticate and store the session cookie.
    #[instrument(skip(self), fields(user = %self.config.username))]
    pub async fn login(&self) -> Result<()> {
        info!("Authenticating with {}", self.config.base_url);
        let response = self
            .http
            .post(self.config.url(AUTH_PATH))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 201 {
            let body = response.text().await.unwrap_or_default();
            warn!(status, "Login refused");
            return Err(BrainError::AuthenticationFailed {
                status,
                body: mapping::snippet(&body),
            });
        }

        let cookie = mapping::session_cookie(
            response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );
        if cookie.is_none() {
            debug!("Login response set no cookie");
        }
        *self.session.write().await = Some(cookie.unwrap_or_default());
        Ok(())
    }

    async fn ensure_session(&self) -> Result<()> {
        if self.session.read().await.is_some() {
            return Ok(());
        }
        self.login().await
    }

    async fn send_once(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Reply> {
        let cookie = self.session.read().await.clone().unwrap_or_default();
        let mut request = self
            .http
            .request(method, url)
            .header(ACCEPT, "application/json");
        if !cookie.is_empty() {
            request = request.header(COOKIE, cookie);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let (retry_after, location) = {
            let headers = response.headers();
            let retry_after =
                mapping::parse_retry_after(headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()));
            let location = headers
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            (retry_after, location)
        };
        let body = response.text().await?;
        Ok(Reply {
            status,
            retry_after,
            location,
            body,
        })
    }

    /// Send with the session attached, logging in again once on 401.
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Reply> {
        self.ensure_session().await?;
        let reply = self.send_once(method.clone(), url, body).await?;
        if reply.status != 401 {
            return Ok(reply);
        }
        debug!(url, "Session expired, logging in again");
        self.login().await?;
        self.send_once(method, url, body).await
    }

    async fn alpha_details(&self, alpha_id: &str) -> Result<Value, GatewayError> {
        let url = self.config.url(&format!("{ALPHAS_PATH}/{alpha_id}"));
        let reply = self.send(Method::GET, &url, None).await?;
        if reply.status != 200 {
            return Err(mapping::classify_error(
                Endpoint::Simulation,
                reply.status,
                reply.retry_after,
                &reply.body,
            ));
        }
        serde_json::from_str(&reply.body)
            .map_err(|e| GatewayError::Transport(format!("unreadable alpha {alpha_id}: {e}")))
    }

    /// Replace the tags on a platform alpha with `tag`.
    #[instrument(skip(self))]
    pub async fn tag_alpha(&self, alpha_id: &str, tag: &str) -> Result<(), GatewayError> {
        let url = self.config.url(&format!("{ALPHAS_PATH}/{alpha_id}"));
        let body = mapping::tags_patch(&[tag]);
        let reply = self.send(Method::PATCH, &url, Some(&body)).await?;
        if reply.status != 200 {
            return Err(mapping::classify_error(
                Endpoint::Submission,
                reply.status,
                reply.retry_after,
                &reply.body,
            ));
        }
        debug!(alpha_id, tag, "Alpha tagged");
        Ok(())
    }

    /// Poll the submission checks of an alpha whose submit POST was accepted.
    ///
    /// The platform already holds the submission, so transient errors here
    /// are waited out rather than returned: a retryable error would make the
    /// caller POST again and get a duplicate rejection.
    async fn await_submission_checks(&self, alpha_id: &str, url: &str) -> Result<(), GatewayError> {
        let interval = self.config.submit_check_interval();
        for check in 1..=self.config.submit_check_attempts {
            let wait = match self.send(Method::GET, url, None).await {
                Err(e) => {
                    warn!(alpha_id, check, error = %e, "Submission check failed, will check again");
                    interval
                }
                Ok(reply) => {
                    match mapping::interpret_submission_check(reply.status, reply.retry_after, &reply.body) {
                        Ok(SubmissionCheck::Passed) => return Ok(()),
                        Ok(SubmissionCheck::Failed(checks)) => {
                            warn!(alpha_id, checks = ?checks, "Submission failed checks");
                            return Err(GatewayError::Rejected(format!(
                                "failed checks: {}",
                                checks.join(", ")
                            )));
                        }
                        Ok(SubmissionCheck::Pending(hint)) => hint.unwrap_or(interval),
                        Err(e) if e.kind().is_retryable() => {
                            warn!(alpha_id, check, error = %e, "Submission check failed, will check again");
                            e.retry_after().unwrap_or(interval)
                        }
                        Err(e) => return Err(e),
                    }
                }
            };
            tokio::time::sleep(wait).await;
        }
        warn!(
            alpha_id,
            checks = self.config.submit_check_attempts,
            "Submission accepted but checks still pending"
        );
        Ok(())
    }
}

#[async_trait]
impl SimulationGateway for BrainClient {
    #[instrument(skip_all, fields(candidate_id = %candidate.id().short()))]
    async fn submit(&self, candidate: &Candidate) -> Result<JobHandle, GatewayError> {
        let body = mapping::simulation_request(candidate);
        let url = self.config.url(SIMULATIONS_PATH);
        let reply = self.send(Method::POST, &url, Some(&body)).await?;
        if reply.status != 201 {
            return Err(mapping::classify_error(
                Endpoint::Simulation,
                reply.status,
                reply.retry_after,
                &reply.body,
            ));
        }
        let location = reply.location.ok_or_else(|| {
            GatewayError::Transport("simulation accepted without a Location header".into())
        })?;
        debug!(handle = %location, "Simulation started");
        Ok(JobHandle(location))
    }

    #[instrument(skip_all, fields(handle = %handle))]
    async fn poll_status(&self, handle: &JobHandle) -> Result<PollStatus, GatewayError> {
        let url = self.config.url(handle.as_str());
        let reply = self.send(Method::GET, &url, None).await?;
        match mapping::interpret_progress(reply.status, reply.retry_after, &reply.body)? {
            Progress::Running(retry_after) => Ok(PollStatus::Running { retry_after }),
            Progress::Failed(message) => Ok(PollStatus::Failed(message)),
            Progress::NotFound => Ok(PollStatus::NotFound),
            Progress::Complete { alpha_id } => {
                let details = self.alpha_details(&alpha_id).await?;
                debug!(alpha_id = %alpha_id, "Simulation complete");
                Ok(PollStatus::Succeeded(mapping::alpha_result(&alpha_id, details)))
            }
        }
    }

    #[instrument(skip_all, fields(handle = %handle))]
    async fn cancel(&self, handle: &JobHandle) -> Result<CancelOutcome, GatewayError> {
        let url = self.config.url(handle.as_str());
        let reply = self.send(Method::DELETE, &url, None).await?;
        match reply.status {
            200 | 202 | 204 => Ok(CancelOutcome::Cancelled),
            404 | 410 => Ok(CancelOutcome::AlreadyTerminal),
            status => Err(mapping::classify_error(
                Endpoint::Simulation,
                status,
                reply.retry_after,
                &reply.body,
            )),
        }
    }

    #[instrument(skip_all, fields(candidate_id = %candidate.id().short()))]
    async fn submit_for_evaluation(
        &self,
        candidate: &Candidate,
        result: &SimulationResult,
    ) -> Result<ConfirmationId, GatewayError> {
        let alpha_id = result
            .alpha_id
            .as_deref()
            .ok_or_else(|| GatewayError::Rejected("simulation produced no alpha id".into()))?;
        let url = self.config.url(&format!("{ALPHAS_PATH}/{alpha_id}/submit"));

        let reply = self.send(Method::POST, &url, None).await?;
        if !matches!(reply.status, 200 | 201) {
            return Err(mapping::classify_error(
                Endpoint::Submission,
                reply.status,
                reply.retry_after,
                &reply.body,
            ));
        }

        self.await_submission_checks(alpha_id, &url).await?;
        info!(alpha_id, "Submission accepted");

        let tag = candidate.strategy_tag();
        if !tag.is_empty() {
            if let Err(e) = self.tag_alpha(alpha_id, tag).await {
                warn!(alpha_id, tag, error = %e, "Could not tag submitted alpha");
            }
        }
        Ok(ConfirmationId(alpha_id.to_string()))
    }
}
