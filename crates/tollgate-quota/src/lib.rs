//! # tollgate-quota
//!
//! The distributed sliding-window quota engine at the heart of Tollgate.
//!
//! ## Overview
//!
//! Admission is a three-dimensional decision (input tokens, output tokens,
//! requests — each per minute) taken atomically against a shared coordination
//! store, so any number of gateway nodes can front the same key set:
//!
//! - **Admit**: check-and-reserve in one indivisible store round-trip
//! - **Commit**: reconcile a reservation with the true usage reported by the
//!   upstream, attributed to the bucket of origin
//! - **Release**: cancel a reservation, returning its provisional additions
//! - **Sweep**: background release of reservations abandoned by crashed nodes
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      tollgate-quota                       │
//! │  ┌────────────┐   ┌──────────────┐   ┌────────────────┐   │
//! │  │   Quota    │──►│ CounterStore │──►│ Redis (Lua) /  │   │
//! │  │   Engine   │   │    trait     │   │ in-memory twin │   │
//! │  └────────────┘   └──────────────┘   └────────────────┘   │
//! │        ▲                                                  │
//! │  ┌────────────┐                                           │
//! │  │   Sweeper  │  releases reservations left open > T     │
//! │  └────────────┘                                           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! All mutable counter state lives in the store; the engine holds only
//! immutable configuration, so nodes share nothing in-process.

pub mod engine;
pub mod reservation;
pub mod store;
pub mod sweep;
pub mod window;

pub use engine::{AdmitDecision, EngineError, QuotaEngine, RateLimitInfo};
pub use reservation::{Reservation, ReservationId, ReservationStatus};
pub use store::{
    AdmitVerdict, CommitOutcome, CounterStore, MemoryCounterStore, RedisCounterStore,
    ReleaseOutcome, StoreAdmit, StoreError,
};
pub use sweep::Sweeper;
pub use window::{now_unix_ms, Dimension, WindowSpec};
