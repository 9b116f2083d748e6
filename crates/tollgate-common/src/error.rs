//! Error types for the Tollgate rate limiter.

use thiserror::Error;

/// Result type alias for Tollgate operations.
pub type TollgateResult<T> = Result<T, TollgateError>;

/// Unified error type for all Tollgate operations.
///
/// Quota exhaustion is an expected outcome of admission, not an error; the
/// engine reports it as a returned decision. The variants here cover the
/// failure taxonomy that crosses crate boundaries.
#[derive(Error, Debug)]
pub enum TollgateError {
    // ─────────────────────────────────────────────────────────────────────────
    // Admission Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Unknown API key")]
    UnknownApiKey,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Store Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Upstream Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream timeout after {seconds} seconds")]
    UpstreamTimeout { seconds: u64 },

    // ─────────────────────────────────────────────────────────────────────────
    // Infrastructure Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for TollgateError {
    fn from(err: serde_json::Error) -> Self {
        TollgateError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TollgateError::UpstreamTimeout { seconds: 30 };
        assert_eq!(err.to_string(), "Upstream timeout after 30 seconds");

        let err = TollgateError::StoreUnavailable("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }
}
