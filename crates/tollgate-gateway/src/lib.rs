//! # tollgate-gateway
//!
//! The admission boundary of Tollgate: an OpenAI-compatible
//! `POST /v1/chat/completions` surface that authenticates the caller,
//! estimates prompt cost, takes an atomic admission decision through
//! `tollgate-quota`, forwards admitted requests to the upstream LLM (or the
//! mock responder), and reconciles true usage on every exit path.

pub mod error;
pub mod estimator;
pub mod protocol;
pub mod reconcile;
pub mod routes;
pub mod server;
pub mod upstream;

pub use error::ApiError;
pub use reconcile::ReservationGuard;
pub use server::{router, serve, AppState};
pub use upstream::{ChatUpstream, HttpUpstream, MockUpstream, UpstreamError};
