//! Router assembly and server lifecycle.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tollgate_common::config::GatewayConfig;
use tollgate_common::{TollgateError, TollgateResult};
use tollgate_quota::{QuotaEngine, Sweeper};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::routes;
use crate::upstream::ChatUpstream;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// The quota engine; all counter state lives behind it.
    pub engine: Arc<QuotaEngine>,
    /// Upstream LLM (real or mock).
    pub upstream: Arc<dyn ChatUpstream>,
    /// Bound the handler applies to every upstream call, regardless of the
    /// upstream implementation's own timeouts.
    pub upstream_timeout_secs: u64,
}

/// Build the admission router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind, spawn the sweep, and serve until shutdown.
pub async fn serve(config: &GatewayConfig, state: AppState) -> TollgateResult<()> {
    let sweeper = Sweeper::new(state.engine.store(), &config.limiter);
    let sweep_handle = sweeper.spawn();

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TollgateError::Configuration(format!("cannot bind {addr}: {e}")))?;
    info!(%addr, "tollgate node serving");

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| TollgateError::Internal(e.to_string()));

    sweep_handle.abort();
    info!("shutdown complete");
    result
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::MockUpstream;
    use std::collections::HashMap;
    use tollgate_common::KeyLimits;
    use tollgate_quota::{MemoryCounterStore, WindowSpec};

    pub(crate) fn test_state() -> AppState {
        let window = WindowSpec {
            segment_ms: 1_000,
            segments: 60,
        };
        let store = Arc::new(MemoryCounterStore::new(window));
        let mut keys = HashMap::new();
        keys.insert("k1".to_string(), KeyLimits::new(100, 200, 3));
        AppState {
            engine: Arc::new(QuotaEngine::new(store, keys, window, 50, false)),
            upstream: Arc::new(MockUpstream::new()),
            upstream_timeout_secs: 30,
        }
    }

    #[tokio::test]
    async fn test_router_builds() {
        let _router = router(test_state());
    }
}
