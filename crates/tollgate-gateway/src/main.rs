//! Tollgate node entry point.
//!
//! Usage: `tollgate [config.toml]` — configuration is layered from compiled
//! defaults, the optional TOML file, and `TOLLGATE_`-prefixed environment
//! variables. Exits non-zero on startup failure (bad configuration, store
//! unreachable).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tollgate_common::config::{load_gateway_config, ObservabilityConfig, UpstreamMode};
use tollgate_common::KeyLimits;
use tollgate_gateway::{AppState, HttpUpstream, MockUpstream};
use tollgate_quota::{CounterStore, MemoryCounterStore, QuotaEngine, RedisCounterStore, WindowSpec};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_file = std::env::args().nth(1);
    let config =
        load_gateway_config(config_file.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.observability);
    info!(
        keys = config.keys.len(),
        window_secs = config.limiter.window_secs,
        "configuration loaded"
    );

    let window = WindowSpec::from_limiter(&config.limiter);
    let store: Arc<dyn CounterStore> = if config.redis.url.is_empty() {
        warn!("no redis url configured; using in-process counters (single-node only)");
        Arc::new(MemoryCounterStore::new(window))
    } else {
        let store = RedisCounterStore::connect(
            &config.redis.url,
            window,
            config.limiter.sweep_secs,
            config.redis.op_timeout_ms,
        )
        .await
        .context("cannot reach coordination store")?;
        store.ping().await.context("coordination store ping failed")?;
        info!(url = %config.redis.url, "coordination store connected");
        Arc::new(store)
    };

    let keys: HashMap<String, KeyLimits> = config.keys.clone();
    let engine = Arc::new(QuotaEngine::new(
        store,
        keys,
        window,
        config.limiter.default_reserve,
        config.limiter.fail_open,
    ));

    let upstream: Arc<dyn tollgate_gateway::ChatUpstream> = match config.upstream.mode {
        UpstreamMode::Mock => {
            info!("answering with the mock upstream");
            Arc::new(MockUpstream::new())
        }
        UpstreamMode::Http => {
            info!(base_url = %config.upstream.base_url, "forwarding to HTTP upstream");
            Arc::new(HttpUpstream::new(&config.upstream)?)
        }
    };

    let state = AppState {
        engine,
        upstream,
        upstream_timeout_secs: config.upstream.timeout_secs,
    };
    tollgate_gateway::serve(&config, state).await?;
    Ok(())
}
