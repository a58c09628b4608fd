//! Platform connection settings

use std::time::Duration;

use crate::error::BrainError;
use crate::Result;

pub const DEFAULT_BASE_URL: &str = "https://api.worldquantbrain.com";

/// Connection settings for the platform API.
#[derive(Clone)]
pub struct BrainConfig {
    /// API root, without a trailing slash
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Wait between submission status checks when the platform gives no hint
    pub submit_check_interval_secs: u64,
    /// Submission status checks before giving up
    pub submit_check_attempts: u32,
}

impl std::fmt::Debug for BrainConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrainConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

impl BrainConfig {
    /// Config for explicit credentials against the default endpoint.
    pub fn new(username: &str, password: &str) -> Self {
        BrainConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            timeout_secs: 30,
            submit_check_interval_secs: 10,
            submit_check_attempts: 30,
        }
    }

    /// Read `WQ_USERNAME`, `WQ_PASSWORD`, `WQ_BASE_URL` and `WQ_TIMEOUT`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` uses the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let username = lookup("WQ_USERNAME")
            .filter(|v| !v.is_empty())
            .ok_or(BrainError::MissingCredentials("WQ_USERNAME"))?;
        let password = lookup("WQ_PASSWORD")
            .filter(|v| !v.is_empty())
            .ok_or(BrainError::MissingCredentials("WQ_PASSWORD"))?;

        let mut config = Self::new(&username, &password);
        if let Some(url) = lookup("WQ_BASE_URL").filter(|v| !v.is_empty()) {
            config = config.with_base_url(&url);
        }
        if let Some(raw) = lookup("WQ_TIMEOUT") {
            config.timeout_secs = raw
                .trim()
                .parse()
                .map_err(|_| BrainError::InvalidConfig(format!("WQ_TIMEOUT={raw} is not a number of seconds")))?;
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn submit_check_interval(&self) -> Duration {
        Duration::from_secs(self.submit_check_interval_secs)
    }

    /// Absolute URL for an API path, or `path` itself if already absolute.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}
