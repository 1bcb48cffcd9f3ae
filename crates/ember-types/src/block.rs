//! Block, header and body types.

use crate::Hash;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Cumulative ("total") difficulty of a chain prefix. Greater total
/// difficulty wins fork choice.
pub type Td = BigUint;

/// Block header. Beyond hash linkage (parent hash and height) the remaining
/// fields are opaque to most consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Hash of the parent block.
    pub parent_hash: Hash,
    /// Block height.
    pub number: u64,
    /// Work contributed by this single block.
    pub difficulty: u64,
    /// Commitment to the block's transactions; zero for an empty body.
    pub transactions_root: Hash,
    /// Millisecond timestamp.
    pub timestamp: u64,
}

impl Header {
    /// Blake2b-256 over the fixed-order field encoding.
    pub fn hash(&self) -> Hash {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.parent_hash.as_bytes());
        hasher.update(self.number.to_be_bytes());
        hasher.update(self.difficulty.to_be_bytes());
        hasher.update(self.transactions_root.as_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Hash::new(out)
    }
}

/// A transaction. The sync machinery moves these around without looking
/// inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Raw transaction payload.
    pub payload: Vec<u8>,
}

/// Block body: the transactions carried by a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub transactions: Vec<Transaction>,
}

/// A full block: header plus body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub body: Body,
}

impl Block {
    /// Block with an empty body.
    pub fn from_header(header: Header) -> Self {
        Self {
            header,
            body: Body::default(),
        }
    }

    /// Block carrying the given transactions.
    pub fn with_body(header: Header, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            body: Body { transactions },
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }
}

/// Head announcement gossiped between peers: the advertised best block and
/// the cumulative difficulty behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadAnnounce {
    pub hash: Hash,
    pub number: u64,
    pub td: Td,
}
