//! Scoped reconciliation of admissions.
//!
//! Any path that was admitted must reach commit-or-release before the
//! handler returns, including cancellation (client disconnect drops the
//! handler future) and panics. The guard owns the reservation id; consuming
//! it via `commit`/`release` settles it inline, and `Drop` settles any path
//! that never got there.

use std::sync::Arc;

use tollgate_common::UnixMillis;
use tollgate_quota::{now_unix_ms, QuotaEngine, ReservationId};
use tracing::warn;

/// Scoped holder of an admission's reservation.
///
/// Constructed with `None` for fail-open admissions, which have nothing to
/// reconcile; every method is then a no-op.
pub struct ReservationGuard {
    engine: Arc<QuotaEngine>,
    reservation: Option<ReservationId>,
}

impl ReservationGuard {
    /// Wrap an admission result.
    pub fn new(engine: Arc<QuotaEngine>, reservation: Option<ReservationId>) -> Self {
        Self {
            engine,
            reservation,
        }
    }

    /// Reconcile with actual usage. Store failures are logged, not
    /// propagated: the response is already in hand, retries happened at the
    /// adapter, and the sweep is the backstop.
    pub async fn commit(mut self, in_actual: u64, out_actual: u64, now: UnixMillis) {
        if let Some(id) = self.reservation.take() {
            if let Err(err) = self.engine.commit(&id, in_actual, out_actual, now).await {
                warn!(reservation = %id, error = %err, "commit failed; sweep will reconcile");
            }
        }
    }

    /// Return the reservation's provisional additions.
    pub async fn release(mut self, now: UnixMillis) {
        if let Some(id) = self.reservation.take() {
            if let Err(err) = self.engine.release(&id, now).await {
                warn!(reservation = %id, error = %err, "release failed; sweep will reconcile");
            }
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if let Some(id) = self.reservation.take() {
            let engine = Arc::clone(&self.engine);
            // Dropped without settling: cancelled or panicked mid-flight.
            tokio::spawn(async move {
                if let Err(err) = engine.release(&id, now_unix_ms()).await {
                    warn!(reservation = %id, error = %err, "release on drop failed; sweep will reconcile");
                }
            });
        }
    }
}
