//! Message typecodes and payloads.

use ember_types::{Block, Body, Hash, HeadAnnounce, Header};
use serde::{Deserialize, Serialize};

/// Message type identifiers. Numeric codes are part of the wire contract and
/// must stay stable across the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Head announcement gossip.
    NewBlockHashes = 1,
    /// Locally mined block; never leaves the node.
    NewMinedBlock = 2,
    /// Request a run of block hashes.
    GetBlockHashes = 3,
    /// Reply: block hashes.
    BlockHashes = 4,
    /// Request a run of headers.
    GetBlockHeaders = 5,
    /// Reply: headers.
    BlockHeaders = 6,
    /// Request bodies by block hash.
    GetBlockBodies = 7,
    /// Reply: bodies, in request order.
    BlockBodies = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::NewBlockHashes),
            2 => Ok(MessageType::NewMinedBlock),
            3 => Ok(MessageType::GetBlockHashes),
            4 => Ok(MessageType::BlockHashes),
            5 => Ok(MessageType::GetBlockHeaders),
            6 => Ok(MessageType::BlockHeaders),
            7 => Ok(MessageType::GetBlockBodies),
            8 => Ok(MessageType::BlockBodies),
            other => Err(other),
        }
    }
}

/// Request for `amount` block hashes starting at `number`, stepping
/// `skip + 1` per element, descending when `reverse` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRequest {
    pub number: u64,
    pub amount: u64,
    pub skip: u64,
    pub reverse: bool,
}

/// Anchor of a header request: a height or a block hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderAnchor {
    Number(u64),
    Hash(Hash),
}

/// Request for `amount` headers from `start`, with the same stride semantics
/// as [`HashRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRequest {
    pub start: HeaderAnchor,
    pub amount: u64,
    pub skip: u64,
    pub reverse: bool,
}

/// Typed message payloads carried on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    NewBlockHashes(HeadAnnounce),
    NewMinedBlock(Block),
    GetBlockHashes(HashRequest),
    BlockHashes(Vec<Hash>),
    GetBlockHeaders(HeaderRequest),
    BlockHeaders(Vec<Header>),
    GetBlockBodies(Vec<Hash>),
    BlockBodies(Vec<Body>),
}

impl Payload {
    /// The typecode this payload travels under.
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::NewBlockHashes(_) => MessageType::NewBlockHashes,
            Payload::NewMinedBlock(_) => MessageType::NewMinedBlock,
            Payload::GetBlockHashes(_) => MessageType::GetBlockHashes,
            Payload::BlockHashes(_) => MessageType::BlockHashes,
            Payload::GetBlockHeaders(_) => MessageType::GetBlockHeaders,
            Payload::BlockHeaders(_) => MessageType::BlockHeaders,
            Payload::GetBlockBodies(_) => MessageType::GetBlockBodies,
            Payload::BlockBodies(_) => MessageType::BlockBodies,
        }
    }
}
