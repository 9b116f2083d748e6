//! Shared test infrastructure for the Tollgate integration suite.

pub mod common;
