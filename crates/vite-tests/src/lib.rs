//! # vite-tests
//!
//! Integration tests for the ledger sync core.
//!
//! This crate provides:
//! - An in-memory chain and test nodes wired over in-process pipes
//! - Deterministic block generators
//! - Scenario tests for bulk sync, gossip, fetching and file transfer
//! - Property-based tests

pub mod generators;
pub mod harness;



#[cfg(test)]
mod gossip_tests;


#[cfg(test)]
mod sync_tests;

pub use generators::*;
pub use harness::*;
