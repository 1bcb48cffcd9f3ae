//! In-memory chain with total-difficulty fork choice.

use crate::{ChainError, ChainResult, ChainStore};
use ember_types::{Block, Hash, Td};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

struct Inner {
    /// Canonical chain; `canonical[i]` is the block at height `i`.
    canonical: Vec<Block>,
    /// Cumulative difficulty per canonical height.
    tds: Vec<Td>,
    /// Valid blocks off the canonical chain, keyed by hash, with the
    /// cumulative difficulty of their branch.
    side: HashMap<Hash, (Block, Td)>,
}

impl Inner {
    fn head(&self) -> &Block {
        // The canonical vector always holds at least the genesis block.
        &self.canonical[self.canonical.len() - 1]
    }

    fn head_td(&self) -> &Td {
        &self.tds[self.tds.len() - 1]
    }

    fn canonical_hash_at(&self, number: u64) -> Option<Hash> {
        self.canonical.get(number as usize).map(Block::hash)
    }

    fn push_canonical(&mut self, block: Block) {
        let td = self.head_td().clone() + block.header.difficulty;
        self.canonical.push(block);
        self.tds.push(td);
    }

    fn insert_one(&mut self, block: &Block) -> Result<(), String> {
        let number = block.number();
        let hash = block.hash();

        // Re-insert of a block we already have is a no-op.
        if self.canonical_hash_at(number) == Some(hash) {
            return Ok(());
        }

        let head_number = self.head().number();
        if number == head_number + 1 && block.parent_hash() == self.head().hash() {
            self.push_canonical(block.clone());
            return Ok(());
        }

        if number == 0 {
            return Err("conflicts with genesis".to_string());
        }
        let parent = block.parent_hash();
        let parent_td = if self.canonical_hash_at(number - 1) == Some(parent) {
            self.tds[(number - 1) as usize].clone()
        } else if let Some((_, td)) = self.side.get(&parent) {
            td.clone()
        } else {
            return Err(format!("unknown parent {parent}"));
        };

        let td = parent_td + block.header.difficulty;
        let leads = td > *self.head_td();
        self.side.insert(hash, (block.clone(), td));
        if leads {
            self.adopt(hash)?;
        }
        Ok(())
    }

    /// Make the side branch ending in `tip` canonical.
    fn adopt(&mut self, tip: Hash) -> Result<(), String> {
        let mut branch = Vec::new();
        let mut cursor = tip;
        loop {
            let Some((block, _)) = self.side.get(&cursor) else {
                return Err(format!("side branch broken at {cursor}"));
            };
            let block = block.clone();
            let number = block.number();
            let parent = block.parent_hash();
            branch.push(block);
            if number >= 1 && self.canonical_hash_at(number - 1) == Some(parent) {
                break;
            }
            cursor = parent;
        }
        branch.reverse();

        let attach = branch[0].number();
        let dropped = self.canonical.len() as u64 - attach;
        self.canonical.truncate(attach as usize);
        self.tds.truncate(attach as usize);
        for block in branch {
            self.side.remove(&block.hash());
            self.push_canonical(block);
        }
        debug!(
            attach,
            dropped,
            head = self.head().number(),
            "switched to heavier branch"
        );
        Ok(())
    }
}

/// An in-memory [`ChainStore`]. Blocks that do not extend the current head
/// accumulate on side branches; the chain switches whenever a branch's
/// cumulative difficulty overtakes the canonical head's.
pub struct MemoryChain {
    inner: RwLock<Inner>,
}

impl MemoryChain {
    /// Chain containing just the genesis block.
    pub fn new(genesis: Block) -> Self {
        let td = Td::from(genesis.header.difficulty);
        info!(hash = %genesis.hash(), "chain initialized");
        Self {
            inner: RwLock::new(Inner {
                canonical: vec![genesis],
                tds: vec![td],
                side: HashMap::new(),
            }),
        }
    }

    /// Height of the canonical head.
    pub fn head_number(&self) -> u64 {
        self.inner.read().head().number()
    }

    /// Hash of the canonical head.
    pub fn head_hash(&self) -> Hash {
        self.inner.read().head().hash()
    }

    /// Cumulative difficulty of the canonical head.
    pub fn head_td(&self) -> Td {
        self.inner.read().head_td().clone()
    }

    /// Canonical block at `number`, if any.
    pub fn block_at(&self, number: u64) -> Option<Block> {
        self.inner.read().canonical.get(number as usize).cloned()
    }

    /// Canonical block hash at `number`, if any.
    pub fn hash_at(&self, number: u64) -> Option<Hash> {
        self.inner.read().canonical_hash_at(number)
    }
}

impl ChainStore for MemoryChain {
    fn current_head(&self) -> (Hash, u64) {
        let inner = self.inner.read();
        (inner.head().hash(), inner.head().number())
    }

    fn total_difficulty(&self, hash: &Hash, number: u64) -> Option<Td> {
        let inner = self.inner.read();
        if inner.canonical_hash_at(number) == Some(*hash) {
            Some(inner.tds[number as usize].clone())
        } else {
            None
        }
    }

    fn has_block(&self, hash: &Hash, number: u64) -> bool {
        self.inner.read().canonical_hash_at(number) == Some(*hash)
    }

    fn insert_chain(&self, blocks: &[Block]) -> ChainResult<usize> {
        let mut inner = self.inner.write();
        for (index, block) in blocks.iter().enumerate() {
            if let Err(reason) = inner.insert_one(block) {
                return Err(ChainError::Rejected {
                    index,
                    height: block.number(),
                    reason,
                });
            }
        }
        Ok(blocks.len())
    }
}
