//! Error taxonomy for the orchestration layer.

use alpha_state::{CandidateId, StoreError};

/// Reasons an expression or its settings are refused before simulation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("expression is empty")]
    Empty,

    #[error("unbalanced parentheses at byte {position}")]
    UnbalancedParens { position: usize },

    #[error("expression is a bare literal: {literal}")]
    BareLiteral { literal: String },

    #[error("expression contains no function call")]
    NoFunctionCall,

    #[error("empty argument list in call to {function}")]
    EmptyCall { function: String },

    #[error("adjacent groups without an operator at byte {position}")]
    AdjacentGroups { position: usize },

    #[error("unsupported {setting}: {value}")]
    UnsupportedSetting { setting: &'static str, value: String },

    #[error("truncation {value} outside [0, 1]")]
    TruncationOutOfRange { value: f64 },
}

/// Errors produced while evaluating a job.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("job {id} is {state}, only SUCCEEDED jobs can be evaluated")]
    NotSucceeded { id: String, state: String },

    #[error("job {id} succeeded without a result payload")]
    MissingResult { id: String },
}

/// Orchestration-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum AlphaError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("job {0} vanished from the store")]
    JobMissing(CandidateId),

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, AlphaError>;
