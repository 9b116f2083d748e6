//! Counter store adapters.
//!
//! The coordination store owns all mutable counter state. This module defines
//! the seam the engine talks through, plus two backends: Redis with
//! server-side Lua scripts (production) and an in-memory twin with identical
//! semantics (tests, store-less mock deployments).
//!
//! Atomicity lives here: each `admit`/`commit`/`release` executes the full
//! check-and-mutate sequence as one indivisible unit with respect to other
//! operations on the same key.

mod memory;
mod redis;

pub use memory::MemoryCounterStore;
pub use redis::RedisCounterStore;

use async_trait::async_trait;
use thiserror::Error;
use tollgate_common::{ApiKey, KeyLimits, UnixMillis};

use crate::reservation::ReservationId;
use crate::window::Dimension;

/// Store adapter errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(#[from] ::redis::RedisError),

    #[error("store operation timed out")]
    Timeout,

    #[error("malformed store reply: {0}")]
    Malformed(String),

    #[error("internal store error: {0}")]
    Internal(String),
}

/// Verdict of an atomic admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitVerdict {
    /// All three dimensions had headroom; the additions are committed and a
    /// reservation recorded.
    Admitted { reservation: ReservationId },
    /// At least one ceiling would be exceeded; nothing was changed.
    Rejected {
        /// The violating dimension with the longest recovery time.
        binding: Dimension,
        /// Whole seconds until that dimension drops below its ceiling.
        retry_after_secs: u64,
    },
}

/// Result of an atomic admission attempt.
#[derive(Debug, Clone, Copy)]
pub struct StoreAdmit {
    /// Admission verdict.
    pub verdict: AdmitVerdict,
    /// Sliding-window sums per dimension (fixed `[in, out, req]` order),
    /// sampled before the additions.
    pub used: [u64; 3],
}

/// Result of a commit.
#[derive(Debug, Clone, Copy)]
pub struct CommitOutcome {
    /// False when the reservation was already settled (idempotent no-op).
    pub applied: bool,
    /// True when b₀ had expired and a delta landed on a fallback bucket.
    pub fallback: bool,
}

/// Result of a release.
#[derive(Debug, Clone, Copy)]
pub struct ReleaseOutcome {
    /// False when the reservation was already settled (idempotent no-op).
    pub applied: bool,
}

/// The coordination-store seam the quota engine operates through.
///
/// Implementations must make each method atomic with respect to concurrent
/// calls on the same key, and must make a returned `commit`/`release` visible
/// to every subsequent `admit` on that key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically check all three ceilings over the sliding window ending at
    /// `now` and, if none would be exceeded, add `(in_est, out_reserve, 1)`
    /// to the current segment and persist an open reservation.
    async fn admit(
        &self,
        key: &ApiKey,
        limits: &KeyLimits,
        in_est: u64,
        out_reserve: u64,
        now: UnixMillis,
    ) -> Result<StoreAdmit, StoreError>;

    /// Replace a reservation's provisional token additions with actual usage
    /// by applying signed deltas to its bucket of origin. Idempotent.
    async fn commit(
        &self,
        id: &ReservationId,
        in_actual: u64,
        out_actual: u64,
        now: UnixMillis,
    ) -> Result<CommitOutcome, StoreError>;

    /// Return a reservation's full provisional additions. Idempotent.
    async fn release(
        &self,
        id: &ReservationId,
        now: UnixMillis,
    ) -> Result<ReleaseOutcome, StoreError>;

    /// Reservations still open whose admission is older than `cutoff`,
    /// bounded by `limit`. Used by the sweep.
    async fn open_reservations_older_than(
        &self,
        cutoff: UnixMillis,
        limit: usize,
    ) -> Result<Vec<ReservationId>, StoreError>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}
