use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ProviderError, ProviderErrorKind};

#[derive(Debug, Error)]
pub enum GauntletError {
    // Provider errors
    #[error("Provider not configured: {0}")]
    UnknownProvider(String),

    #[error("Provider {provider} request failed: {message}")]
    ProviderRequest { provider: String, message: String },

    // Graph errors
    #[error("Node '{0}' not found in graph")]
    NodeNotFound(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    // Run errors
    #[error("Stage {stage} failed after {attempts} attempt(s) ({category}): {message}")]
    StageFailed {
        stage: String,
        attempts: u32,
        category: FailureCategory,
        message: String,
    },

    #[error("Gate {gate} exceeded its retry loop budget ({max_loops})")]
    LoopLimitExceeded { gate: String, max_loops: u32 },

    #[error("Run exceeded max steps ({0})")]
    MaxStepsExceeded(usize),

    #[error("Run terminated at {node}: {message}")]
    Terminated { node: String, message: String },

    #[error("Run cancelled: deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    #[error("Workflow context is frozen")]
    ContextFrozen,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GauntletError {
    /// True for the deadline outcome, which ends a run as Cancelled rather than Failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, GauntletError>;

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    Fatal,
}

/// What went wrong in a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Throttling, timeouts, dropped connections, 5xx responses.
    Transient,
    /// The provider answered but the payload could not be parsed.
    Malformed,
    /// Invalid request, authentication failure, unknown model.
    Permanent,
    /// Missing provider, bad template, or other local misconfiguration.
    Configuration,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Malformed => write!(f, "malformed"),
            Self::Permanent => write!(f, "permanent"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

/// Outcome of a single failed node attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub kind: FailureKind,
    pub category: FailureCategory,
    pub message: String,
}

impl NodeFailure {
    pub fn retryable(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            category,
            message: message.into(),
        }
    }

    pub fn fatal(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            category,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }

    /// Turn a retryable failure into a fatal one once the retry budget is spent.
    pub fn escalate(mut self) -> Self {
        self.kind = FailureKind::Fatal;
        self
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.category)
    }
}

impl From<ProviderError> for NodeFailure {
    fn from(e: ProviderError) -> Self {
        match e.kind {
            ProviderErrorKind::Transient => Self::retryable(FailureCategory::Transient, e.message),
            ProviderErrorKind::Permanent => Self::fatal(FailureCategory::Permanent, e.message),
        }
    }
}
