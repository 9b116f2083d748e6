//! HTTP-level tests of the admission surface.
//!
//! Each test drives the real router with the mock upstream over the
//! in-memory store, asserting the wire contract: status codes, the
//! OpenAI-shaped bodies, and the rate-limit headers.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tollgate_integration_tests::common::{test_app_state, test_key, QuotaFixture};
use tollgate_quota::Dimension;
use tower::ServiceExt;

fn chat_request(auth: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = auth {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn minimal_body(max_tokens: u64) -> Value {
    json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "Hi"}],
        "max_tokens": max_tokens,
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn admitted_request_returns_usage_and_capacity_headers() {
    let fixture = QuotaFixture::new();
    let app = tollgate_gateway::router(test_app_state(&fixture));

    let response = app
        .oneshot(chat_request(Some("k1"), minimal_body(20)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers.get("x-ratelimit-limit-requests").unwrap(), "3");
    assert_eq!(headers.get("x-ratelimit-remaining-requests").unwrap(), "2");
    // The 20-token reserve makes output the tightest token dimension.
    assert_eq!(headers.get("x-ratelimit-limit-tokens").unwrap(), "200");
    assert_eq!(headers.get("x-ratelimit-remaining-tokens").unwrap(), "180");

    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-4o-mini");
    assert!(body["usage"]["prompt_tokens"].as_u64().unwrap() > 0);
    assert!(body["usage"]["completion_tokens"].as_u64().unwrap() <= 20);

    // The admission was reconciled: one request and the actual completion
    // tokens remain in the window, not the full reserve.
    let now = tollgate_quota::now_unix_ms();
    assert_eq!(
        fixture.store.window_sum(&test_key(), Dimension::Requests, now),
        1
    );
    let out = fixture
        .store
        .window_sum(&test_key(), Dimension::OutputTokens, now);
    assert!(out <= 20, "reserve should have been reconciled, got {out}");
    assert_eq!(fixture.store.open_reservation_count(), 0);
}

#[tokio::test]
async fn unknown_key_is_rejected_without_touching_counters() {
    let fixture = QuotaFixture::new();
    let app = tollgate_gateway::router(test_app_state(&fixture));

    let response = app
        .oneshot(chat_request(Some("who-dis"), minimal_body(10)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "invalid_api_key");

    let now = tollgate_quota::now_unix_ms();
    for dim in Dimension::ALL {
        assert_eq!(fixture.store.window_sum(&test_key(), dim, now), 0);
    }
}

#[tokio::test]
async fn missing_authorization_is_unauthorized() {
    let fixture = QuotaFixture::new();
    let app = tollgate_gateway::router(test_app_state(&fixture));

    let response = app
        .oneshot(chat_request(None, minimal_body(10)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_body_is_bad_request() {
    let fixture = QuotaFixture::new();
    let app = tollgate_gateway::router(test_app_state(&fixture));

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer k1")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unsupported_streaming_is_bad_request() {
    let fixture = QuotaFixture::new();
    let app = tollgate_gateway::router(test_app_state(&fixture));

    let body = json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "Hi"}],
        "stream": true,
    });
    let response = app.oneshot(chat_request(Some("k1"), body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn exhausted_key_gets_429_with_retry_hint() {
    let fixture = QuotaFixture::new();
    let state = test_app_state(&fixture);

    for _ in 0..3 {
        let app = tollgate_gateway::router(state.clone());
        let response = app
            .oneshot(chat_request(Some("k1"), minimal_body(5)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let app = tollgate_gateway::router(state);
    let response = app
        .oneshot(chat_request(Some("k1"), minimal_body(5)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(
        response
            .headers()
            .get("x-ratelimit-remaining-requests")
            .unwrap(),
        "0"
    );

    let body = body_json(response).await;
    assert_eq!(
        body,
        json!({
            "error": {
                "message": "Rate limit exceeded",
                "type": "rate_limit_exceeded",
                "code": "rate_limit_exceeded"
            }
        })
    );
}

/// Upstream that always answers with a server error.
struct BrokenUpstream;

#[async_trait::async_trait]
impl tollgate_gateway::ChatUpstream for BrokenUpstream {
    async fn complete(
        &self,
        _request: &tollgate_gateway::protocol::ChatCompletionRequest,
    ) -> Result<tollgate_gateway::protocol::ChatCompletionResponse, tollgate_gateway::UpstreamError>
    {
        Err(tollgate_gateway::UpstreamError::Status { status: 500 })
    }
}

/// Upstream that always exceeds its deadline.
struct StalledUpstream;

#[async_trait::async_trait]
impl tollgate_gateway::ChatUpstream for StalledUpstream {
    async fn complete(
        &self,
        _request: &tollgate_gateway::protocol::ChatCompletionRequest,
    ) -> Result<tollgate_gateway::protocol::ChatCompletionResponse, tollgate_gateway::UpstreamError>
    {
        Err(tollgate_gateway::UpstreamError::Timeout { seconds: 30 })
    }
}

#[tokio::test]
async fn upstream_failure_returns_502_and_releases_reservation() {
    let fixture = QuotaFixture::new();
    let state = tollgate_gateway::AppState {
        engine: fixture.engine.clone(),
        upstream: std::sync::Arc::new(BrokenUpstream),
        upstream_timeout_secs: 30,
    };
    let app = tollgate_gateway::router(state);

    let response = app
        .oneshot(chat_request(Some("k1"), minimal_body(10)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // The admission was rolled back on the failure path.
    let now = tollgate_quota::now_unix_ms();
    for dim in Dimension::ALL {
        assert_eq!(fixture.store.window_sum(&test_key(), dim, now), 0);
    }
    assert_eq!(fixture.store.open_reservation_count(), 0);
}

/// Upstream that never resolves at all.
struct HangingUpstream;

#[async_trait::async_trait]
impl tollgate_gateway::ChatUpstream for HangingUpstream {
    async fn complete(
        &self,
        _request: &tollgate_gateway::protocol::ChatCompletionRequest,
    ) -> Result<tollgate_gateway::protocol::ChatCompletionResponse, tollgate_gateway::UpstreamError>
    {
        std::future::pending().await
    }
}

#[tokio::test]
async fn handler_bounds_an_upstream_that_never_returns() {
    let fixture = QuotaFixture::new();
    let state = tollgate_gateway::AppState {
        engine: fixture.engine.clone(),
        upstream: std::sync::Arc::new(HangingUpstream),
        upstream_timeout_secs: 0,
    };
    let app = tollgate_gateway::router(state);

    let response = app
        .oneshot(chat_request(Some("k1"), minimal_body(10)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(fixture.store.open_reservation_count(), 0);
}

#[tokio::test]
async fn upstream_timeout_returns_504_and_releases_reservation() {
    let fixture = QuotaFixture::new();
    let state = tollgate_gateway::AppState {
        engine: fixture.engine.clone(),
        upstream: std::sync::Arc::new(StalledUpstream),
        upstream_timeout_secs: 30,
    };
    let app = tollgate_gateway::router(state);

    let response = app
        .oneshot(chat_request(Some("k1"), minimal_body(10)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(fixture.store.open_reservation_count(), 0);
}

#[tokio::test]
async fn health_reports_serving_and_store_reachable() {
    let fixture = QuotaFixture::new();
    let app = tollgate_gateway::router(test_app_state(&fixture));

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store_reachable"], true);
}
