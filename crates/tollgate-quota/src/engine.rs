//! The quota engine: atomic admission, reconciliation, and header math.
//!
//! The engine holds only immutable configuration and a handle to the counter
//! store; every mutable counter lives server-side. Time is always an explicit
//! parameter so the engine is deterministic under test.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tollgate_common::{ApiKey, KeyLimits, UnixMillis};
use tracing::{debug, warn};

use crate::reservation::ReservationId;
use crate::store::{AdmitVerdict, CounterStore, StoreError};
use crate::window::{Dimension, WindowSpec};

/// Engine errors. Quota exhaustion is not an error — it is the `Rejected`
/// decision.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown API key")]
    UnknownKey,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Remaining-capacity snapshot for the outward-facing headers, taken on the
/// tightest binding dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Request ceiling.
    pub limit_requests: u64,
    /// Requests remaining in the window.
    pub remaining_requests: u64,
    /// Token ceiling of the tightest token dimension.
    pub limit_tokens: u64,
    /// Tokens remaining on that dimension.
    pub remaining_tokens: u64,
    /// Which token dimension populated the token headers.
    pub token_dimension: Dimension,
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone)]
pub enum AdmitDecision {
    /// The request may proceed. `reservation` is `None` only when the store
    /// was down and the engine is configured to fail open; such requests are
    /// not accounted and there is nothing to reconcile.
    Admitted {
        reservation: Option<ReservationId>,
        headers: RateLimitInfo,
    },
    /// At least one ceiling would be exceeded.
    Rejected {
        headers: RateLimitInfo,
        retry_after_secs: u64,
    },
}

impl AdmitDecision {
    /// Headers for either outcome.
    pub fn headers(&self) -> &RateLimitInfo {
        match self {
            AdmitDecision::Admitted { headers, .. } => headers,
            AdmitDecision::Rejected { headers, .. } => headers,
        }
    }
}

/// The distributed sliding-window quota engine.
pub struct QuotaEngine {
    store: Arc<dyn CounterStore>,
    keys: HashMap<String, KeyLimits>,
    window: WindowSpec,
    default_reserve: u64,
    fail_open: bool,
}

impl QuotaEngine {
    /// Create an engine over a store and an immutable per-key limits table.
    pub fn new(
        store: Arc<dyn CounterStore>,
        keys: HashMap<String, KeyLimits>,
        window: WindowSpec,
        default_reserve: u64,
        fail_open: bool,
    ) -> Self {
        Self {
            store,
            keys,
            window,
            default_reserve,
            fail_open,
        }
    }

    /// Ceilings for a key, or `None` when the key is not configured.
    pub fn limits_for(&self, key: &ApiKey) -> Option<KeyLimits> {
        self.keys.get(key.as_str()).copied()
    }

    /// Output-token reserve for a request: the declared `max_tokens`
    /// verbatim, or the configured default when absent.
    pub fn reserve_for(&self, max_tokens: Option<u64>) -> u64 {
        max_tokens.unwrap_or(self.default_reserve)
    }

    /// Window geometry, shared with the sweeper.
    pub fn window(&self) -> WindowSpec {
        self.window
    }

    /// Store handle, shared with the sweeper and the health probe.
    pub fn store(&self) -> Arc<dyn CounterStore> {
        Arc::clone(&self.store)
    }

    /// Atomically decide admission of `(in_est, out_reserve, 1)` for `key`
    /// at instant `now`.
    pub async fn admit(
        &self,
        key: &ApiKey,
        in_est: u64,
        out_reserve: u64,
        now: UnixMillis,
    ) -> Result<AdmitDecision, EngineError> {
        let limits = self.limits_for(key).ok_or(EngineError::UnknownKey)?;

        let admit = match self
            .store
            .admit(key, &limits, in_est, out_reserve, now)
            .await
        {
            Ok(admit) => admit,
            Err(err) if self.fail_open => {
                warn!(key = %key, error = %err, "store unavailable, failing open");
                metrics::counter!("tollgate_admit_fail_open_total").increment(1);
                return Ok(AdmitDecision::Admitted {
                    reservation: None,
                    headers: headers_after_add(&limits, [0, 0, 0], in_est, out_reserve),
                });
            }
            Err(err) => return Err(err.into()),
        };

        match admit.verdict {
            AdmitVerdict::Admitted { reservation } => Ok(AdmitDecision::Admitted {
                reservation: Some(reservation),
                headers: headers_after_add(&limits, admit.used, in_est, out_reserve),
            }),
            AdmitVerdict::Rejected {
                binding,
                retry_after_secs,
            } => {
                debug!(key = %key, %binding, retry_after_secs, "rejected");
                Ok(AdmitDecision::Rejected {
                    headers: headers_rejected(&limits, admit.used, binding),
                    retry_after_secs,
                })
            }
        }
    }

    /// Reconcile a reservation with the actual usage reported by the
    /// upstream. Idempotent: settling an already-settled reservation changes
    /// no counter.
    pub async fn commit(
        &self,
        id: &ReservationId,
        in_actual: u64,
        out_actual: u64,
        now: UnixMillis,
    ) -> Result<(), EngineError> {
        let outcome = self.store.commit(id, in_actual, out_actual, now).await?;
        if !outcome.applied {
            debug!(reservation = %id, "commit on settled reservation ignored");
        }
        if outcome.fallback {
            warn!(reservation = %id, "origin bucket expired, commit delta applied to fallback bucket");
            metrics::counter!("tollgate_commit_bucket_fallback_total").increment(1);
        }
        Ok(())
    }

    /// Cancel a reservation, returning its provisional additions. Idempotent.
    pub async fn release(&self, id: &ReservationId, now: UnixMillis) -> Result<(), EngineError> {
        let outcome = self.store.release(id, now).await?;
        if !outcome.applied {
            debug!(reservation = %id, "release on settled reservation ignored");
        }
        Ok(())
    }
}

/// Tightest token dimension given per-dimension remainders: the smaller
/// remaining-to-ceiling ratio wins; ties go to the output dimension, whose
/// reserve is the coarser estimate.
fn tightest_token_dimension(limits: &KeyLimits, rem_in: u64, rem_out: u64) -> Dimension {
    // Compare rem_in / limit_in vs rem_out / limit_out without floats.
    let lhs = (rem_in as u128) * (limits.output_tpm.max(1) as u128);
    let rhs = (rem_out as u128) * (limits.input_tpm.max(1) as u128);
    if lhs < rhs {
        Dimension::InputTokens
    } else {
        Dimension::OutputTokens
    }
}

fn headers_after_add(
    limits: &KeyLimits,
    used: [u64; 3],
    in_est: u64,
    out_reserve: u64,
) -> RateLimitInfo {
    let rem_in = limits.input_tpm.saturating_sub(used[0] + in_est);
    let rem_out = limits.output_tpm.saturating_sub(used[1] + out_reserve);
    let rem_req = limits.rpm.saturating_sub(used[2] + 1);
    let token_dimension = tightest_token_dimension(limits, rem_in, rem_out);
    let (limit_tokens, remaining_tokens) = match token_dimension {
        Dimension::InputTokens => (limits.input_tpm, rem_in),
        _ => (limits.output_tpm, rem_out),
    };
    RateLimitInfo {
        limit_requests: limits.rpm,
        remaining_requests: rem_req,
        limit_tokens,
        remaining_tokens,
        token_dimension,
    }
}

fn headers_rejected(limits: &KeyLimits, used: [u64; 3], binding: Dimension) -> RateLimitInfo {
    let rem_in = limits.input_tpm.saturating_sub(used[0]);
    let rem_out = limits.output_tpm.saturating_sub(used[1]);
    let rem_req = limits.rpm.saturating_sub(used[2]);
    // When a token dimension rejected the request it is by definition the
    // tightest one; otherwise fall back to the ratio rule.
    let token_dimension = if binding.is_tokens() {
        binding
    } else {
        tightest_token_dimension(limits, rem_in, rem_out)
    };
    let (limit_tokens, remaining_tokens) = match token_dimension {
        Dimension::InputTokens => (limits.input_tpm, rem_in),
        _ => (limits.output_tpm, rem_out),
    };
    RateLimitInfo {
        limit_requests: limits.rpm,
        remaining_requests: rem_req,
        limit_tokens,
        remaining_tokens,
        token_dimension,
    }
}
