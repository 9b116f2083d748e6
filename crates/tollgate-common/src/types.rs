//! Common value types used across the Tollgate crates.

use serde::{Deserialize, Serialize};

/// Unix timestamp in milliseconds.
///
/// The quota engine takes time as an explicit parameter everywhere so tests
/// can drive a virtual clock; this alias marks those parameters.
pub type UnixMillis = u64;

/// An opaque client API key.
///
/// Keys are configured at startup and immutable for the process lifetime.
/// `Display` redacts all but a short prefix so keys never land in logs.
///
/// # Example
/// ```
/// use tollgate_common::ApiKey;
///
/// let key = ApiKey::new("sk-test-12345678");
/// assert_eq!(key.to_string(), "sk-test-…");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    /// Create an API key from its raw string form.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The full key, for store key naming and config lookup.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "{}…", prefix)
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Per-key ceilings over the sliding window.
///
/// All three ceilings apply over the same 60-second window; a request is
/// admitted only if none of the three would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLimits {
    /// Input (prompt) tokens per minute.
    pub input_tpm: u64,
    /// Output (completion) tokens per minute.
    pub output_tpm: u64,
    /// Requests per minute.
    pub rpm: u64,
}

impl KeyLimits {
    /// Create a limits triple.
    pub fn new(input_tpm: u64, output_tpm: u64, rpm: u64) -> Self {
        Self {
            input_tpm,
            output_tpm,
            rpm,
        }
    }
}
