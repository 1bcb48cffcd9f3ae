//! # ember-tests
//!
//! Integration and property tests for the sync engine, plus the shared
//! harness (in-memory bus, chain stores and scripted peers) they run on.

pub mod generators;
pub mod harness;

#[cfg(test)]
mod sync_tests;
