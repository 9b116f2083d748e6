//! # tollgate-common
//!
//! Shared types and utilities for the Tollgate distributed rate limiter.
//!
//! This crate provides the foundation used across the Tollgate crates:
//! - `tollgate-quota`: sliding-window quota engine and reconciler
//! - `tollgate-gateway`: OpenAI-compatible admission handler

pub mod error;
pub mod health;
pub mod types;

#[cfg(feature = "config")]
pub mod config;

pub use error::{TollgateError, TollgateResult};
pub use health::HealthResponse;
pub use types::{ApiKey, KeyLimits, UnixMillis};

#[cfg(feature = "config")]
pub use config::{
    load_config, load_gateway_config, GatewayConfig, LimiterConfig, ObservabilityConfig,
    RedisConfig, ServerConfig, UpstreamConfig, UpstreamMode,
};
