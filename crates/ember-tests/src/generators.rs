//! Deterministic chain builders for sync tests.

use ember_types::{Block, Hash, Header, Td, Transaction};

/// The canonical test genesis block.
pub fn genesis() -> Block {
    Block::from_header(Header {
        parent_hash: Hash::ZERO,
        number: 0,
        difficulty: 1,
        transactions_root: Hash::ZERO,
        timestamp: 0,
    })
}

fn pseudo_root(seed: u64, number: u64) -> Hash {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&seed.to_be_bytes());
    bytes[8..16].copy_from_slice(&number.to_be_bytes());
    bytes[16] = 1;
    Hash::new(bytes)
}

/// Extend `parent` with `count` blocks of unit difficulty. The `seed` varies
/// the content, so different seeds yield divergent chains. Every third block
/// carries an empty body.
pub fn extend(parent: &Block, count: u64, seed: u64) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count as usize);
    let mut parent_hash = parent.hash();
    let mut number = parent.number();
    for _ in 0..count {
        number += 1;
        let empty_body = number % 3 == 0;
        let header = Header {
            parent_hash,
            number,
            difficulty: 1,
            transactions_root: if empty_body {
                Hash::ZERO
            } else {
                pseudo_root(seed, number)
            },
            timestamp: seed.wrapping_mul(1_000_003).wrapping_add(number),
        };
        let block = if empty_body {
            Block::from_header(header)
        } else {
            let payload = [seed.to_be_bytes(), number.to_be_bytes()].concat();
            Block::with_body(header, vec![Transaction { payload }])
        };
        parent_hash = block.hash();
        blocks.push(block);
    }
    blocks
}

/// A full chain: genesis plus `length` blocks, indexed by height.
pub fn build_chain(length: u64, seed: u64) -> Vec<Block> {
    let mut blocks = vec![genesis()];
    let tail = extend(&blocks[0], length, seed);
    blocks.extend(tail);
    blocks
}

/// Fork `base` at `fork_at`: shared prefix up to and including that height,
/// then fresh blocks up to height `length`.
pub fn fork(base: &[Block], fork_at: u64, length: u64, seed: u64) -> Vec<Block> {
    let mut blocks = base[..=(fork_at as usize)].to_vec();
    let tail = extend(&blocks[blocks.len() - 1], length - fork_at, seed);
    blocks.extend(tail);
    blocks
}

/// Cumulative difficulty of a whole chain.
pub fn total_difficulty(blocks: &[Block]) -> Td {
    blocks
        .iter()
        .map(|block| Td::from(block.header.difficulty))
        .sum()
}
