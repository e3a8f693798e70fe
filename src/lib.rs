//! Custody settlement service.
//!
//! A withdrawal/deposit settlement pipeline for a custodial platform:
//! an HTTP API records withdrawals into a status-driven ledger, a
//! worker pool settles accepted withdrawals on-chain or through a
//! custodial exchange, a confirmation watcher promotes submitted
//! transfers to completed, and a staging promoter credits observed
//! deposits exactly once.

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
