//! Health check response
//!
//! A node is "serving" as soon as the HTTP listener is up; the store probe
//! is reported alongside so operators can tell the two failure modes apart.

use serde::Serialize;

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Whether the coordination store answered the probe
    pub store_reachable: bool,
}

impl HealthResponse {
    /// Create a response reflecting the store probe result.
    pub fn serving(store_reachable: bool) -> Self {
        Self {
            status: if store_reachable {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            store_reachable,
        }
    }
}
