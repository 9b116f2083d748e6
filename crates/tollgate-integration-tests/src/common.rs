//! Common test utilities for integration tests.
//!
//! The scenarios in the test suite use one reference key `k1` with
//! `input_tpm = 100`, `output_tpm = 200`, `rpm = 3`, a 1-second segment over
//! a 60-second window, and a default reserve of 50 — the literal values the
//! end-to-end scenarios are written against.

use std::collections::HashMap;
use std::sync::Arc;

use tollgate_common::{ApiKey, KeyLimits, UnixMillis};
use tollgate_gateway::{AppState, MockUpstream};
use tollgate_quota::{
    AdmitDecision, MemoryCounterStore, QuotaEngine, RateLimitInfo, ReservationId, WindowSpec,
};

/// Reference key used across scenarios.
pub const TEST_KEY: &str = "k1";

/// Default output reserve used across scenarios.
pub const DEFAULT_RESERVE: u64 = 50;

/// Convert scenario seconds to engine milliseconds.
pub fn secs(t: u64) -> UnixMillis {
    t * 1_000
}

/// The reference key.
pub fn test_key() -> ApiKey {
    ApiKey::new(TEST_KEY)
}

/// Engine + store fixture over a virtual clock.
pub struct QuotaFixture {
    pub store: Arc<MemoryCounterStore>,
    pub engine: Arc<QuotaEngine>,
    pub window: WindowSpec,
}

impl QuotaFixture {
    /// Fixture with the reference `k1` limits.
    pub fn new() -> Self {
        Self::with_limits(KeyLimits::new(100, 200, 3))
    }

    /// Fixture with custom limits on `k1`.
    pub fn with_limits(limits: KeyLimits) -> Self {
        let window = WindowSpec {
            segment_ms: 1_000,
            segments: 60,
        };
        let store = Arc::new(MemoryCounterStore::new(window));
        let mut keys = HashMap::new();
        keys.insert(TEST_KEY.to_string(), limits);
        let engine = Arc::new(QuotaEngine::new(
            store.clone(),
            keys,
            window,
            DEFAULT_RESERVE,
            false,
        ));
        Self {
            store,
            engine,
            window,
        }
    }

    /// Admit and unwrap the accounted reservation, panicking on rejection.
    pub async fn admit_ok(
        &self,
        in_est: u64,
        out_reserve: u64,
        now: UnixMillis,
    ) -> (ReservationId, RateLimitInfo) {
        match self
            .engine
            .admit(&test_key(), in_est, out_reserve, now)
            .await
            .expect("admit should not error")
        {
            AdmitDecision::Admitted {
                reservation: Some(id),
                headers,
            } => (id, headers),
            other => panic!("expected accounted admission, got {:?}", other),
        }
    }

    /// Admit and unwrap the rejection, panicking on admission.
    pub async fn admit_rejected(
        &self,
        in_est: u64,
        out_reserve: u64,
        now: UnixMillis,
    ) -> (RateLimitInfo, u64) {
        match self
            .engine
            .admit(&test_key(), in_est, out_reserve, now)
            .await
            .expect("admit should not error")
        {
            AdmitDecision::Rejected {
                headers,
                retry_after_secs,
            } => (headers, retry_after_secs),
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}

impl Default for QuotaFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Gateway state over the fixture engine and the mock upstream.
pub fn test_app_state(fixture: &QuotaFixture) -> AppState {
    AppState {
        engine: fixture.engine.clone(),
        upstream: Arc::new(MockUpstream::new()),
        upstream_timeout_secs: 30,
    }
}
