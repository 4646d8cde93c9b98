// =============================================================================
// Error kinds — typed classification driving retry / reject / pause behavior
// =============================================================================
//
// Kinds, not call sites:
//   config     — invalid settings; only surfaced at startup, aborts process.
//   transient  — network / 5xx / rate-limit; retried with jittered backoff.
//   rejection  — broker refused for business reasons; never retried.
//   data       — missing or corrupt input; skip the rule / hold the decision.
//   integrity  — invariant violation; pauses the symbol until operator resume.
//   timeout    — budget exceeded; treated as transient for broker calls.
// =============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Business reason a broker refused an order. Never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MinAmount,
    MinNotional,
    InsufficientFunds,
    InvalidSymbol,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MinAmount => write!(f, "min_amount"),
            Self::MinNotional => write!(f, "min_notional"),
            Self::InsufficientFunds => write!(f, "insufficient_funds"),
            Self::InvalidSymbol => write!(f, "invalid_symbol"),
        }
    }
}

/// Error returned by broker port operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Network failure, HTTP 5xx, or rate limiting. Safe to retry.
    #[error("transient broker error: {0}")]
    Transient(String),

    /// The broker refused the order for a business reason. Not retried.
    #[error("order rejected: {reason} ({detail})")]
    Rejected { reason: RejectReason, detail: String },

    /// Per-call budget exceeded. Callers treat this like `Transient`.
    #[error("broker call timed out after {0} ms")]
    Timeout(i64),

    /// Malformed or missing response payload.
    #[error("broker returned unusable data: {0}")]
    Data(String),
}

impl BrokerError {
    /// True for kinds a bounded-backoff retry loop may attempt again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    pub fn rejected(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self::Rejected {
            reason,
            detail: detail.into(),
        }
    }
}

/// Engine-level error surfaced by the execute-trade use case and the loops.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("storage error: {0}")]
    Storage(String),

    /// An invariant was violated (e.g. FIFO produced negative inventory).
    /// The affected symbol's evaluation loop pauses until operator resume.
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("missing or corrupt data: {0}")]
    Data(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(BrokerError::Transient("503".into()).is_retryable());
        assert!(BrokerError::Timeout(5000).is_retryable());
        assert!(!BrokerError::rejected(RejectReason::MinNotional, "1 < 5").is_retryable());
        assert!(!BrokerError::Data("empty body".into()).is_retryable());
    }

    #[test]
    fn reject_reason_display_is_snake_case() {
        assert_eq!(RejectReason::MinNotional.to_string(), "min_notional");
        assert_eq!(RejectReason::InsufficientFunds.to_string(), "insufficient_funds");
    }
}
