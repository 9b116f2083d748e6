//! HTTP handlers for the admission surface.
//!
//! Per-request sequence: authenticate → parse → estimate → admit → upstream
//! → reconcile → respond. The reservation guard makes the reconcile step
//! unconditional: every exit path after admission settles the reservation.

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tollgate_common::{ApiKey, HealthResponse};
use tollgate_quota::{now_unix_ms, AdmitDecision, CounterStore, EngineError};
use tracing::{debug, instrument};

use crate::error::{rate_limit_headers, ApiError};
use crate::estimator;
use crate::protocol::ChatCompletionRequest;
use crate::reconcile::ReservationGuard;
use crate::server::AppState;
use crate::upstream::UpstreamError;

/// Extract the Bearer API key from the Authorization header.
fn bearer_key(headers: &HeaderMap) -> Option<ApiKey> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(ApiKey::new(token))
}

/// `POST /v1/chat/completions`
#[instrument(name = "chat.completions", skip_all, fields(key, reservation))]
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let api_key = bearer_key(&headers).ok_or(ApiError::Unauthorized)?;
    tracing::Span::current().record("key", tracing::field::display(&api_key));

    // Unknown keys are rejected before any counter is touched.
    if state.engine.limits_for(&api_key).is_none() {
        return Err(ApiError::Unauthorized);
    }

    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.to_string()))?;
    request.validate().map_err(ApiError::BadRequest)?;

    let in_est = estimator::estimate_prompt(&request);
    let out_reserve = state.engine.reserve_for(request.max_tokens.map(u64::from));

    let decision = state
        .engine
        .admit(&api_key, in_est, out_reserve, now_unix_ms())
        .await
        .map_err(|err| match err {
            EngineError::UnknownKey => ApiError::Unauthorized,
            EngineError::Store(_) => ApiError::StoreUnavailable,
        })?;

    let (reservation, info) = match decision {
        AdmitDecision::Rejected {
            headers,
            retry_after_secs,
        } => {
            return Err(ApiError::RateLimited {
                info: headers,
                retry_after_secs,
            });
        }
        AdmitDecision::Admitted {
            reservation,
            headers,
        } => (reservation, headers),
    };
    if let Some(id) = &reservation {
        tracing::Span::current().record("reservation", tracing::field::display(id));
    }

    let guard = ReservationGuard::new(state.engine.clone(), reservation);

    // The handler bounds the upstream call itself; an upstream
    // implementation without its own deadline cannot hold the reservation
    // open indefinitely.
    let outcome = match tokio::time::timeout(
        Duration::from_secs(state.upstream_timeout_secs),
        state.upstream.complete(&request),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(UpstreamError::Timeout {
            seconds: state.upstream_timeout_secs,
        }),
    };

    match outcome {
        Ok(response) => {
            let (in_actual, out_actual) = estimator::measure_usage(&response);
            debug!(in_est, in_actual, out_reserve, out_actual, "reconciling usage");
            guard.commit(in_actual, out_actual, now_unix_ms()).await;

            let mut response = (StatusCode::OK, Json(response)).into_response();
            response.headers_mut().extend(rate_limit_headers(&info));
            Ok(response)
        }
        Err(UpstreamError::Timeout { seconds }) => {
            guard.release(now_unix_ms()).await;
            Err(ApiError::UpstreamTimeout { seconds })
        }
        Err(err) => {
            guard.release(now_unix_ms()).await;
            Err(ApiError::UpstreamFailed(err.to_string()))
        }
    }
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_reachable = state.engine.store().ping().await.is_ok();
    Json(HealthResponse::serving(store_reachable))
}
