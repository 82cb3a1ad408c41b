use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Lane;

/// Unified error type for the entire Prism pipeline.
#[derive(Error, Debug)]
pub enum PrismError {
    // ── Request validation ─────────────────────────────────────
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    // ── Circuit breaker ────────────────────────────────────────
    #[error("circuit open for {target}")]
    CircuitOpen { target: String },

    // ── Retrieval lanes ────────────────────────────────────────
    #[error("lane {lane} timed out after {budget_ms}ms")]
    LaneTimeout { lane: Lane, budget_ms: u64 },

    #[error("lane {lane} failed: {reason}")]
    LaneFailed { lane: Lane, reason: String },

    // ── LLM providers ──────────────────────────────────────────
    #[error("provider {provider} timed out")]
    ProviderTimeout { provider: String },

    #[error("provider {provider} failed: {reason}")]
    Provider { provider: String, reason: String },

    #[error("no model fits the request: {0}")]
    NoCandidate(String),

    // ── Guided prompt ──────────────────────────────────────────
    #[error("budget exceeded: {resource}: used {used:.4}, limit {limit:.4}")]
    BudgetExceeded {
        resource: String,
        used: f64,
        limit: f64,
    },

    // ── Streaming ──────────────────────────────────────────────
    #[error("stream exceeded its duration cap")]
    StreamTimedOut,

    // ── Configuration ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    #[error("model catalog error: {0}")]
    Catalog(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PrismError>;

/// The observable error category exposed to clients and logs. This is the
/// wire-level taxonomy; [`PrismError`] variants map onto it via
/// [`PrismError::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    RateLimited,
    CircuitOpen,
    LaneTimeout,
    LaneError,
    ProviderTimeout,
    ProviderError,
    BudgetExceeded,
    StreamTimedOut,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::LaneTimeout => "lane_timeout",
            Self::LaneError => "lane_error",
            Self::ProviderTimeout => "provider_timeout",
            Self::ProviderError => "provider_error",
            Self::BudgetExceeded => "budget_exceeded",
            Self::StreamTimedOut => "stream_timed_out",
            Self::Internal => "internal",
        }
    }

    /// Whether a client is expected to succeed on retry.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::LaneTimeout | Self::ProviderTimeout | Self::StreamTimedOut
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PrismError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::LaneTimeout { .. } => ErrorKind::LaneTimeout,
            Self::LaneFailed { .. } => ErrorKind::LaneError,
            Self::ProviderTimeout { .. } => ErrorKind::ProviderTimeout,
            Self::Provider { .. } | Self::NoCandidate(_) => ErrorKind::ProviderError,
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::StreamTimedOut => ErrorKind::StreamTimedOut,
            Self::Config(_)
            | Self::ConfigValidation { .. }
            | Self::Catalog(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = PrismError::Validation("too long".into());
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        let err = PrismError::LaneTimeout {
            lane: Lane::Vector,
            budget_ms: 2000,
        };
        assert_eq!(err.kind(), ErrorKind::LaneTimeout);
        assert!(err.kind().retryable());

        let err = PrismError::Config("missing".into());
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.kind().retryable());
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(ErrorKind::ValidationError.as_str(), "validation_error");
        assert_eq!(ErrorKind::StreamTimedOut.as_str(), "stream_timed_out");
        let json = serde_json::to_string(&ErrorKind::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
    }
}
