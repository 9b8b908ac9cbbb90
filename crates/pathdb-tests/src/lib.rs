//! # pathdb-tests
//!
//! Integration tests for the path database.
//!
//! This crate provides comprehensive cross-module testing including:
//! - Layer tree growth, flattening and read consistency
//! - State history rollback and recoverability
//! - Shutdown journal round-trips and corruption handling
//! - Disable/enable state sync transitions

pub mod generators;
pub mod harness;

#[cfg(test)]
mod database_tests;

#[cfg(test)]
mod recover_tests;

#[cfg(test)]
mod journal_tests;

pub use generators::*;
pub use harness::*;
