//! Configuration loading utilities.
//!
//! Layered configuration loading using figment:
//! - Default values (compiled in)
//! - Configuration file (TOML)
//! - Environment variables
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate_common::config::load_gateway_config;
//!
//! let config = load_gateway_config(Some("tollgate.toml"))?;
//! ```

use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{TollgateError, TollgateResult};
use crate::types::KeyLimits;

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Per-operation timeout in milliseconds.
    ///
    /// Bounds every admit/commit/release round-trip; an admit that exceeds
    /// this is handled by the configured fail policy.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_op_timeout_ms() -> u64 {
    500
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

/// Sliding-window limiter configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimiterConfig {
    /// Segment size S in seconds. Must divide `window_secs` evenly.
    #[serde(default = "default_segment_secs")]
    pub segment_secs: u64,

    /// Window W in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Deadline after which an open reservation is released by the sweep.
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,

    /// How often the background sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Output-token reserve applied when a request omits `max_tokens`.
    #[serde(default = "default_reserve")]
    pub default_reserve: u64,

    /// On store outage: admit without accounting (`true`) or reject with a
    /// retry hint (`false`).
    #[serde(default)]
    pub fail_open: bool,
}

fn default_segment_secs() -> u64 {
    1
}

fn default_window_secs() -> u64 {
    60
}

fn default_sweep_secs() -> u64 {
    120
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_reserve() -> u64 {
    512
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            segment_secs: default_segment_secs(),
            window_secs: default_window_secs(),
            sweep_secs: default_sweep_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            default_reserve: default_reserve(),
            fail_open: false,
        }
    }
}

impl LimiterConfig {
    /// Validate structural constraints the window algebra depends on.
    pub fn validate(&self) -> TollgateResult<()> {
        if self.segment_secs == 0 || self.window_secs == 0 {
            return Err(TollgateError::Configuration(
                "segment_secs and window_secs must be non-zero".to_string(),
            ));
        }
        if self.window_secs % self.segment_secs != 0 {
            return Err(TollgateError::Configuration(format!(
                "window_secs ({}) must be a multiple of segment_secs ({})",
                self.window_secs, self.segment_secs
            )));
        }
        if self.sweep_secs < self.window_secs {
            return Err(TollgateError::Configuration(format!(
                "sweep_secs ({}) must be at least window_secs ({})",
                self.sweep_secs, self.window_secs
            )));
        }
        Ok(())
    }
}

/// Which upstream answers admitted requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    /// Deterministic OpenAI-shaped mock responder.
    #[default]
    Mock,
    /// Real HTTP upstream (OpenAI-compatible).
    Http,
}

/// Upstream LLM configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Upstream mode.
    #[serde(default)]
    pub mode: UpstreamMode,

    /// Base URL for the HTTP upstream, e.g. `https://api.openai.com`.
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,

    /// Bearer token forwarded to the HTTP upstream.
    pub api_key: Option<String>,

    /// Bound on the upstream call, in seconds.
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_upstream_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_upstream_timeout_secs() -> u64 {
    60
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            mode: UpstreamMode::Mock,
            base_url: default_upstream_base_url(),
            api_key: None,
            timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging.
    #[serde(default)]
    pub json_logs: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GatewayConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Sliding-window limiter configuration.
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Upstream LLM configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Per-key ceilings, keyed by the raw API key.
    #[serde(default)]
    pub keys: HashMap<String, KeyLimits>,
}

impl GatewayConfig {
    /// Validate the loaded configuration.
    pub fn validate(&self) -> TollgateResult<()> {
        self.limiter.validate()?;
        if self.keys.is_empty() {
            return Err(TollgateError::Configuration(
                "no API keys configured under [keys]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Sources (in order of precedence):
/// 1. Defaults (lowest)
/// 2. Configuration file (if provided)
/// 3. Environment variables (highest)
///
/// Environment variables are prefixed with the uppercase `prefix` followed by
/// `_`. For example, with prefix "tollgate", `TOLLGATE_SERVER_PORT` sets
/// `server.port`.
pub fn load_config<T: Default + Serialize + for<'de> Deserialize<'de>>(
    prefix: &str,
    config_file: Option<&str>,
) -> Result<T, figment::Error> {
    let mut figment = Figment::new().merge(Serialized::defaults(T::default()));

    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed(&format!("{}_", prefix.to_uppercase())).split("_"));

    figment.extract()
}

/// Load and validate the gateway configuration.
pub fn load_gateway_config(config_file: Option<&str>) -> TollgateResult<GatewayConfig> {
    let config: GatewayConfig = load_config("tollgate", config_file)
        .map_err(|e| TollgateError::Configuration(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
