//! Reservation records for the admit/reconcile protocol.
//!
//! An admission commits provisional additions before the upstream call, when
//! the true output cost is unknown. The reservation is the durable record
//! that the addition happened and has not yet been reconciled; it transitions
//! exactly once from `Open` to `Committed` or `Released` (the latter also via
//! the background sweep).

use serde::{Deserialize, Serialize};
use tollgate_common::UnixMillis;
use uuid::Uuid;

/// Unique identifier for a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Create a fresh reservation ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ReservationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Reservation status state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Provisional additions are counted; reconciliation pending.
    Open,
    /// Reconciled with actual usage.
    Committed,
    /// Cancelled; provisional additions returned.
    Released,
}

impl ReservationStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Released)
    }
}

/// A reservation held against a key's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique reservation ID.
    pub id: ReservationId,
    /// API key the counters belong to.
    pub api_key: String,
    /// Bucket of origin b₀; commit deltas are attributed here.
    pub bucket: u64,
    /// Estimated prompt tokens added on admit.
    pub in_est: u64,
    /// Output-token reserve added on admit.
    pub out_reserve: u64,
    /// Admission timestamp t₀.
    pub created_at_ms: UnixMillis,
    /// Current status.
    pub status: ReservationStatus,
}

impl Reservation {
    /// Create an open reservation at its bucket of origin.
    pub fn open(
        api_key: impl Into<String>,
        bucket: u64,
        in_est: u64,
        out_reserve: u64,
        created_at_ms: UnixMillis,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            api_key: api_key.into(),
            bucket,
            in_est,
            out_reserve,
            created_at_ms,
            status: ReservationStatus::Open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!ReservationStatus::Open.is_terminal());
        assert!(ReservationStatus::Committed.is_terminal());
        assert!(ReservationStatus::Released.is_terminal());
    }

    #[test]
    fn test_open_reservation() {
        let res = Reservation::open("k1", 42, 10, 20, 42_500);
        assert_eq!(res.status, ReservationStatus::Open);
        assert_eq!(res.bucket, 42);
        assert_eq!(res.in_est, 10);
        assert_eq!(res.out_reserve, 20);
    }

    #[test]
    fn test_id_parse_round_trip() {
        let id = ReservationId::new();
        let parsed: ReservationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ReservationId::new(), ReservationId::new());
    }
}
