//! HTTP error mapping for the admission surface.
//!
//! The engine reports quota exhaustion as a decision, not an error; here the
//! full taxonomy (rejection included) is turned into OpenAI-shaped error
//! responses with the rate-limit headers clients expect.

use axum::http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tollgate_quota::RateLimitInfo;
use tracing::error;

use crate::protocol::ErrorBody;

pub const HEADER_LIMIT_REQUESTS: HeaderName = HeaderName::from_static("x-ratelimit-limit-requests");
pub const HEADER_REMAINING_REQUESTS: HeaderName =
    HeaderName::from_static("x-ratelimit-remaining-requests");
pub const HEADER_LIMIT_TOKENS: HeaderName = HeaderName::from_static("x-ratelimit-limit-tokens");
pub const HEADER_REMAINING_TOKENS: HeaderName =
    HeaderName::from_static("x-ratelimit-remaining-tokens");

/// Rate-limit headers for the tightest binding dimensions, attached to every
/// admission outcome.
pub fn rate_limit_headers(info: &RateLimitInfo) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(4);
    let mut put = |name: HeaderName, value: u64| {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(name, value);
        }
    };
    put(HEADER_LIMIT_REQUESTS, info.limit_requests);
    put(HEADER_REMAINING_REQUESTS, info.remaining_requests);
    put(HEADER_LIMIT_TOKENS, info.limit_tokens);
    put(HEADER_REMAINING_TOKENS, info.remaining_tokens);
    headers
}

/// Admission-surface failures, one variant per taxonomy kind.
#[derive(Debug)]
pub enum ApiError {
    /// Quota exceeded: 429 with retry hint and capacity headers.
    RateLimited {
        info: RateLimitInfo,
        retry_after_secs: u64,
    },
    /// Unknown or malformed API key: 401.
    Unauthorized,
    /// Malformed body or unsupported field: 400.
    BadRequest(String),
    /// Coordination store down under the fail-closed policy: 503.
    StoreUnavailable,
    /// Upstream failure: 502.
    UpstreamFailed(String),
    /// Upstream deadline exceeded: 504.
    UpstreamTimeout { seconds: u64 },
    /// Invariant violation: 500, never swallowed silently.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RateLimited {
                info,
                retry_after_secs,
            } => {
                let body = ErrorBody::new(
                    "Rate limit exceeded",
                    "rate_limit_exceeded",
                    "rate_limit_exceeded",
                );
                let mut headers = rate_limit_headers(&info);
                headers.insert(
                    RETRY_AFTER,
                    HeaderValue::from_str(&retry_after_secs.to_string())
                        .unwrap_or(HeaderValue::from_static("1")),
                );
                (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
            }
            ApiError::Unauthorized => {
                let body = ErrorBody::new(
                    "Incorrect API key provided",
                    "invalid_request_error",
                    "invalid_api_key",
                );
                (StatusCode::UNAUTHORIZED, Json(body)).into_response()
            }
            ApiError::BadRequest(message) => {
                let body = ErrorBody::new(message, "invalid_request_error", "invalid_request");
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            ApiError::StoreUnavailable => {
                let body = ErrorBody::new(
                    "Rate limiter temporarily unavailable",
                    "service_unavailable",
                    "store_unavailable",
                );
                let mut headers = HeaderMap::new();
                headers.insert(RETRY_AFTER, HeaderValue::from_static("1"));
                (StatusCode::SERVICE_UNAVAILABLE, headers, Json(body)).into_response()
            }
            ApiError::UpstreamFailed(message) => {
                let body = ErrorBody::new(message, "upstream_error", "upstream_error");
                (StatusCode::BAD_GATEWAY, Json(body)).into_response()
            }
            ApiError::UpstreamTimeout { seconds } => {
                let body = ErrorBody::new(
                    format!("Upstream timed out after {seconds} seconds"),
                    "upstream_error",
                    "upstream_timeout",
                );
                (StatusCode::GATEWAY_TIMEOUT, Json(body)).into_response()
            }
            ApiError::Internal(message) => {
                error!(message, "internal error on admission path");
                let body = ErrorBody::new(
                    "Internal server error",
                    "internal_error",
                    "internal_error",
                );
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}
