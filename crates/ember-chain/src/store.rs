//! The chain-store trait.

use crate::ChainResult;
use ember_types::{Block, Hash, Td};

/// Chain-store surface the sync engine depends on.
///
/// Implementations are internally synchronized: every method may be called
/// concurrently from many tasks.
pub trait ChainStore: Send + Sync {
    /// Hash and height of the current best block.
    fn current_head(&self) -> (Hash, u64);

    /// Cumulative difficulty of the chain block `(hash, number)`, if it is
    /// part of the canonical chain.
    fn total_difficulty(&self, hash: &Hash, number: u64) -> Option<Td>;

    /// Whether `(hash, number)` is part of the canonical chain.
    fn has_block(&self, hash: &Hash, number: u64) -> bool;

    /// Insert a batch of hash-linked blocks. Each block is validated and
    /// applied atomically in order; on failure the error reports the index of
    /// the first block that was not inserted. Returns the number of blocks
    /// accepted.
    fn insert_chain(&self, blocks: &[Block]) -> ChainResult<usize>;
}
