//! Error types for brain-client

use alpha_core::GatewayError;
use thiserror::Error;

/// Errors raised while talking to the platform API.
#[derive(Error, Debug)]
pub enum BrainError {
    /// A required credential was not configured
    #[error("missing credential: {0} is not set")]
    MissingCredentials(&'static str),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Login was refused
    #[error("authentication failed (status {status}): {body}")]
    AuthenticationFailed { status: u16, body: String },

    /// Request never produced a response
    #[error("HTTP error: {0}")]
    Http(String),

    /// Response body did not have the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for BrainError {
    fn from(err: reqwest::Error) -> Self {
        BrainError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for BrainError {
    fn from(err: serde_json::Error) -> Self {
        BrainError::Decode(err.to_string())
    }
}

impl From<BrainError> for GatewayError {
    fn from(err: BrainError) -> Self {
        match err {
            BrainError::AuthenticationFailed { .. } | BrainError::MissingCredentials(_) => {
                GatewayError::Auth(err.to_string())
            }
            BrainError::InvalidConfig(_) => GatewayError::Rejected(err.to_string()),
            BrainError::Http(_) | BrainError::Decode(_) => GatewayError::Transport(err.to_string()),
        }
    }
}
