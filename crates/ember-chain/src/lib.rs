//! # ember-chain
//!
//! The chain-store surface the rest of the node builds on: head lookup,
//! total-difficulty queries, block membership and batch insertion, plus an
//! in-memory reference implementation with total-difficulty fork choice.

mod error;
mod memory;
mod store;

pub use error::{ChainError, ChainResult};
pub use memory::MemoryChain;
pub use store::ChainStore;
