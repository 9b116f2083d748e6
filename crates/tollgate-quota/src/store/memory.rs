//! In-memory counter store.
//!
//! Semantic twin of the Redis backend behind one mutex: the whole
//! check-and-mutate sequence runs under the lock, giving the same atomicity
//! the Lua scripts give. Expiry is simulated from the caller-supplied clock,
//! which is what lets the property tests drive a virtual timeline.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tollgate_common::{ApiKey, KeyLimits, UnixMillis};

use super::{
    AdmitVerdict, CommitOutcome, CounterStore, ReleaseOutcome, StoreAdmit, StoreError,
};
use crate::reservation::{Reservation, ReservationId, ReservationStatus};
use crate::window::{Dimension, WindowSpec};

#[derive(Debug, Clone, Copy)]
struct SegmentCell {
    count: u64,
    expires_at_ms: UnixMillis,
}

#[derive(Default)]
struct Inner {
    /// (api_key, dimension, bucket) → live count.
    segments: HashMap<(String, Dimension, u64), SegmentCell>,
    reservations: HashMap<ReservationId, Reservation>,
}

/// In-memory implementation of [`CounterStore`].
pub struct MemoryCounterStore {
    window: WindowSpec,
    inner: Mutex<Inner>,
}

impl MemoryCounterStore {
    /// Create an empty store over the given window geometry.
    pub fn new(window: WindowSpec) -> Self {
        Self {
            window,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Live sliding-window sum for one dimension, for test assertions.
    pub fn window_sum(&self, key: &ApiKey, dim: Dimension, now: UnixMillis) -> u64 {
        let b = self.window.bucket(now);
        self.inner
            .lock()
            .map(|inner| Self::sum_dimension(&inner, &self.window, key.as_str(), dim, b, now))
            .unwrap_or(0)
    }

    /// Number of reservations still open, for test assertions.
    pub fn open_reservation_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .reservations
                    .values()
                    .filter(|r| r.status == ReservationStatus::Open)
                    .count()
            })
            .unwrap_or(0)
    }

    fn sum_dimension(
        inner: &Inner,
        window: &WindowSpec,
        key: &str,
        dim: Dimension,
        b: u64,
        now: UnixMillis,
    ) -> u64 {
        let oldest = window.oldest_bucket(b);
        (oldest..=b)
            .filter_map(|bucket| inner.segments.get(&(key.to_string(), dim, bucket)))
            .filter(|cell| cell.expires_at_ms > now)
            .map(|cell| cell.count)
            .sum()
    }

    /// Earliest in-window bucket holding a live count for `dim`, or `None`.
    fn earliest_live_bucket(
        inner: &Inner,
        window: &WindowSpec,
        key: &str,
        dim: Dimension,
        b: u64,
        now: UnixMillis,
    ) -> Option<u64> {
        let oldest = window.oldest_bucket(b);
        (oldest..=b).find(|bucket| {
            inner
                .segments
                .get(&(key.to_string(), dim, *bucket))
                .is_some_and(|cell| cell.expires_at_ms > now && cell.count > 0)
        })
    }

    /// Apply a signed delta to `b0`, or to the oldest live bucket when `b0`
    /// has expired. Segment counts floor at zero. Returns whether a fallback
    /// bucket was used.
    fn apply_delta(
        inner: &mut Inner,
        window: &WindowSpec,
        key: &str,
        dim: Dimension,
        b0: u64,
        delta: i64,
        now: UnixMillis,
    ) -> bool {
        if delta == 0 {
            return false;
        }
        let ttl = window.segment_ttl_ms();
        let b = window.bucket(now);

        let live = |inner: &Inner, bucket: u64| {
            inner
                .segments
                .get(&(key.to_string(), dim, bucket))
                .is_some_and(|cell| cell.expires_at_ms > now)
        };

        let (target, fallback) = if live(inner, b0) {
            (b0, false)
        } else if let Some(bucket) = Self::earliest_live_bucket(inner, window, key, dim, b, now) {
            (bucket, true)
        } else if delta > 0 {
            (b, true)
        } else {
            // Nothing live to subtract from; the counts already evaporated.
            return false;
        };

        let cell = inner
            .segments
            .entry((key.to_string(), dim, target))
            .or_insert(SegmentCell {
                count: 0,
                expires_at_ms: now + ttl,
            });
        cell.count = cell.count.saturating_add_signed(delta);
        cell.expires_at_ms = now + ttl;
        fallback
    }

    fn settle(
        inner: &mut Inner,
        id: &ReservationId,
        status: ReservationStatus,
    ) -> Option<Reservation> {
        let res = inner.reservations.get(id)?;
        if res.status != ReservationStatus::Open {
            return None;
        }
        let mut res = inner.reservations.remove(id)?;
        res.status = status;
        Some(res)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn admit(
        &self,
        key: &ApiKey,
        limits: &KeyLimits,
        in_est: u64,
        out_reserve: u64,
        now: UnixMillis,
    ) -> Result<StoreAdmit, StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let window = self.window;
        let b = window.bucket(now);
        let adds = [in_est, out_reserve, 1];
        let ceilings = [limits.input_tpm, limits.output_tpm, limits.rpm];

        let mut used = [0u64; 3];
        for dim in Dimension::ALL {
            used[dim.index()] =
                Self::sum_dimension(&inner, &window, key.as_str(), dim, b, now);
        }

        // Reject on the violating dimension with the longest recovery.
        let mut binding: Option<(Dimension, u64)> = None;
        for dim in Dimension::ALL {
            let i = dim.index();
            if used[i] + adds[i] > ceilings[i] {
                let retry_ms = Self::earliest_live_bucket(&inner, &window, key.as_str(), dim, b, now)
                    .map(|bucket| window.bucket_exit_ms(bucket).saturating_sub(now))
                    .unwrap_or_else(|| window.window_ms());
                if binding.map_or(true, |(_, best)| retry_ms > best) {
                    binding = Some((dim, retry_ms));
                }
            }
        }
        if let Some((dim, retry_ms)) = binding {
            return Ok(StoreAdmit {
                verdict: AdmitVerdict::Rejected {
                    binding: dim,
                    retry_after_secs: window.clamp_retry_secs(retry_ms),
                },
                used,
            });
        }

        let ttl = window.segment_ttl_ms();
        for dim in Dimension::ALL {
            let add = adds[dim.index()];
            if add == 0 {
                continue;
            }
            let cell = inner
                .segments
                .entry((key.as_str().to_string(), dim, b))
                .or_insert(SegmentCell {
                    count: 0,
                    expires_at_ms: now + ttl,
                });
            // A cell past its TTL is dead; a fresh write starts from zero.
            if cell.expires_at_ms <= now {
                cell.count = 0;
            }
            cell.count += add;
            cell.expires_at_ms = now + ttl;
        }

        let reservation = Reservation::open(key.as_str(), b, in_est, out_reserve, now);
        let id = reservation.id;
        inner.reservations.insert(id, reservation);

        Ok(StoreAdmit {
            verdict: AdmitVerdict::Admitted { reservation: id },
            used,
        })
    }

    async fn commit(
        &self,
        id: &ReservationId,
        in_actual: u64,
        out_actual: u64,
        now: UnixMillis,
    ) -> Result<CommitOutcome, StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let Some(res) = Self::settle(&mut inner, id, ReservationStatus::Committed) else {
            return Ok(CommitOutcome {
                applied: false,
                fallback: false,
            });
        };

        let window = self.window;
        let delta_in = in_actual as i64 - res.in_est as i64;
        let delta_out = out_actual as i64 - res.out_reserve as i64;
        let mut fallback = false;
        fallback |= Self::apply_delta(
            &mut inner,
            &window,
            &res.api_key,
            Dimension::InputTokens,
            res.bucket,
            delta_in,
            now,
        );
        fallback |= Self::apply_delta(
            &mut inner,
            &window,
            &res.api_key,
            Dimension::OutputTokens,
            res.bucket,
            delta_out,
            now,
        );

        Ok(CommitOutcome {
            applied: true,
            fallback,
        })
    }

    async fn release(
        &self,
        id: &ReservationId,
        now: UnixMillis,
    ) -> Result<ReleaseOutcome, StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let Some(res) = Self::settle(&mut inner, id, ReservationStatus::Released) else {
            return Ok(ReleaseOutcome { applied: false });
        };

        let window = self.window;
        let deltas = [
            (Dimension::InputTokens, -(res.in_est as i64)),
            (Dimension::OutputTokens, -(res.out_reserve as i64)),
            (Dimension::Requests, -1),
        ];
        for (dim, delta) in deltas {
            Self::apply_delta(&mut inner, &window, &res.api_key, dim, res.bucket, delta, now);
        }

        Ok(ReleaseOutcome { applied: true })
    }

    async fn open_reservations_older_than(
        &self,
        cutoff: UnixMillis,
        limit: usize,
    ) -> Result<Vec<ReservationId>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut stale: Vec<&Reservation> = inner
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Open && r.created_at_ms < cutoff)
            .collect();
        stale.sort_by_key(|r| r.created_at_ms);
        Ok(stale.into_iter().take(limit).map(|r| r.id).collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryCounterStore {
        MemoryCounterStore::new(WindowSpec {
            segment_ms: 1_000,
            segments: 60,
        })
    }

    fn limits() -> KeyLimits {
        KeyLimits::new(100, 200, 3)
    }

    fn key() -> ApiKey {
        ApiKey::new("k1")
    }

    async fn admit_ok(
        store: &MemoryCounterStore,
        in_est: u64,
        out_reserve: u64,
        now: UnixMillis,
    ) -> ReservationId {
        match store
            .admit(&key(), &limits(), in_est, out_reserve, now)
            .await
            .unwrap()
            .verdict
        {
            AdmitVerdict::Admitted { reservation } => reservation,
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_admit_adds_to_all_dimensions() {
        let store = store();
        admit_ok(&store, 10, 20, 0).await;

        assert_eq!(store.window_sum(&key(), Dimension::InputTokens, 0), 10);
        assert_eq!(store.window_sum(&key(), Dimension::OutputTokens, 0), 20);
        assert_eq!(store.window_sum(&key(), Dimension::Requests, 0), 1);
    }

    #[tokio::test]
    async fn test_admit_rejects_on_requests_ceiling() {
        let store = store();
        for _ in 0..3 {
            admit_ok(&store, 1, 10, 0).await;
        }

        let result = store.admit(&key(), &limits(), 1, 10, 0).await.unwrap();
        match result.verdict {
            AdmitVerdict::Rejected {
                binding,
                retry_after_secs,
            } => {
                assert_eq!(binding, Dimension::Requests);
                assert_eq!(retry_after_secs, 60);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        // Rejection leaves counters untouched.
        assert_eq!(store.window_sum(&key(), Dimension::Requests, 0), 3);
    }

    #[tokio::test]
    async fn test_admit_rejects_on_output_reserve() {
        let store = store();
        admit_ok(&store, 1, 200, 0).await;

        let result = store.admit(&key(), &limits(), 1, 1, 500).await.unwrap();
        match result.verdict {
            AdmitVerdict::Rejected { binding, .. } => {
                assert_eq!(binding, Dimension::OutputTokens)
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_counts_fall_out_of_window() {
        let store = store();
        admit_ok(&store, 10, 20, 0).await;

        // Still inside the window at t = 59.999 s.
        assert_eq!(
            store.window_sum(&key(), Dimension::InputTokens, 59_999),
            10
        );
        // Outside at t = 60 s.
        assert_eq!(store.window_sum(&key(), Dimension::InputTokens, 60_000), 0);
    }

    #[tokio::test]
    async fn test_commit_applies_deltas_to_origin_bucket() {
        let store = store();
        let id = admit_ok(&store, 10, 20, 0).await;

        let outcome = store.commit(&id, 10, 5, 2_000).await.unwrap();
        assert!(outcome.applied);
        assert!(!outcome.fallback);

        assert_eq!(store.window_sum(&key(), Dimension::InputTokens, 2_000), 10);
        assert_eq!(store.window_sum(&key(), Dimension::OutputTokens, 2_000), 5);
        assert_eq!(store.window_sum(&key(), Dimension::Requests, 2_000), 1);
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let store = store();
        let id = admit_ok(&store, 10, 20, 0).await;

        assert!(store.commit(&id, 10, 5, 1_000).await.unwrap().applied);
        assert!(!store.commit(&id, 10, 5, 1_000).await.unwrap().applied);
        assert!(!store.release(&id, 1_000).await.unwrap().applied);

        assert_eq!(store.window_sum(&key(), Dimension::OutputTokens, 1_000), 5);
    }

    #[tokio::test]
    async fn test_release_returns_full_triple() {
        let store = store();
        let id = admit_ok(&store, 10, 20, 0).await;

        assert!(store.release(&id, 1_000).await.unwrap().applied);

        for dim in Dimension::ALL {
            assert_eq!(store.window_sum(&key(), dim, 1_000), 0, "{dim}");
        }
        assert_eq!(store.open_reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = store();
        let id = admit_ok(&store, 10, 20, 0).await;

        assert!(store.release(&id, 1_000).await.unwrap().applied);
        assert!(!store.release(&id, 1_000).await.unwrap().applied);
        assert!(!store.commit(&id, 10, 5, 1_000).await.unwrap().applied);
    }

    #[tokio::test]
    async fn test_segments_never_go_negative() {
        let store = store();
        let id = admit_ok(&store, 10, 200, 0).await;

        // Another admission in a later bucket, then a large negative delta
        // against the first bucket.
        admit_ok(&store, 1, 0, 1_500).await;
        store.commit(&id, 0, 0, 2_000).await.unwrap();

        // in: 10 + 1 − 10 = 1; out: 200 − 200 = 0. Never below zero.
        assert_eq!(store.window_sum(&key(), Dimension::InputTokens, 2_000), 1);
        assert_eq!(store.window_sum(&key(), Dimension::OutputTokens, 2_000), 0);
    }

    #[tokio::test]
    async fn test_commit_after_origin_expiry_uses_fallback() {
        let store = store();
        let id = admit_ok(&store, 10, 50, 0).await;

        // Long upstream call: the origin bucket's TTL (2 W) lapses, but a
        // newer admission keeps a live bucket in the window.
        let late = 125_000;
        admit_ok(&store, 5, 5, late).await;
        let outcome = store.commit(&id, 12, 7, late).await.unwrap();
        assert!(outcome.applied);
        assert!(outcome.fallback);

        // Positive delta (12 − 10 = 2) landed on the live bucket.
        assert_eq!(
            store.window_sum(&key(), Dimension::InputTokens, late),
            5 + 2
        );
    }

    #[tokio::test]
    async fn test_sweep_scan_finds_stale_open_reservations() {
        let store = store();
        let id_old = admit_ok(&store, 1, 1, 0).await;
        let id_new = admit_ok(&store, 1, 1, 100_000).await;

        let stale = store
            .open_reservations_older_than(50_000, 10)
            .await
            .unwrap();
        assert_eq!(stale, vec![id_old]);

        store.release(&id_old, 130_000).await.unwrap();
        let stale = store
            .open_reservations_older_than(200_000, 10)
            .await
            .unwrap();
        assert_eq!(stale, vec![id_new]);
    }
}
