//! Test harness: in-memory bus, chain stores and scripted peers.

use crate::generators;
use ember_chain::{ChainResult, ChainStore, MemoryChain};
use ember_router::{
    Event, HashRequest, HeaderAnchor, HeaderRequest, MessageType, Payload, Router, StationFilter,
};
use ember_sync::{SyncConfig, SyncService};
use ember_types::{Block, Body, Hash, Header, Td};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a scripted peer misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFault {
    /// Honest peer.
    None,
    /// Never replies to anything.
    Silent,
    /// Honest hashes and headers, but body requests go unanswered.
    MuteBodies,
    /// Headers are served with nudged timestamps, so their hashes never
    /// match the advertised boundaries.
    CorruptHeaders,
    /// Hash replies are padded with junk beyond the requested amount.
    OversizedHashes,
}

fn walk_hashes(blocks: &[Block], req: &HashRequest, fault: PeerFault) -> Vec<Hash> {
    let mut out = Vec::new();
    let mut number = req.number;
    for _ in 0..req.amount {
        let Some(block) = blocks.get(number as usize) else {
            break;
        };
        out.push(block.hash());
        if req.reverse {
            match number.checked_sub(req.skip + 1) {
                Some(next) => number = next,
                None => break,
            }
        } else {
            number += req.skip + 1;
        }
    }
    if fault == PeerFault::OversizedHashes {
        for junk in 0..4u8 {
            out.push(Hash::new([0xee ^ junk; 32]));
        }
    }
    out
}

fn walk_headers(blocks: &[Block], req: &HeaderRequest, fault: PeerFault) -> Vec<Header> {
    let start = match req.start {
        HeaderAnchor::Number(number) => number,
        HeaderAnchor::Hash(hash) => match blocks.iter().position(|b| b.hash() == hash) {
            Some(index) => index as u64,
            None => return Vec::new(),
        },
    };
    let mut out = Vec::new();
    let mut number = start;
    for _ in 0..req.amount {
        let Some(block) = blocks.get(number as usize) else {
            break;
        };
        let mut header = block.header.clone();
        if fault == PeerFault::CorruptHeaders {
            header.timestamp = header.timestamp.wrapping_add(1);
        }
        out.push(header);
        if req.reverse {
            match number.checked_sub(req.skip + 1) {
                Some(next) => number = next,
                None => break,
            }
        } else {
            number += req.skip + 1;
        }
    }
    out
}

/// Register a scripted peer on the bus under `station`, serving `blocks`.
pub fn spawn_peer(router: &Router, station: &str, blocks: Vec<Block>, fault: PeerFault) {
    router.register_remote(station);
    let mut hash_reqs = router.subscribe(
        StationFilter::To(station.to_string()),
        MessageType::GetBlockHashes,
    );
    let mut header_reqs = router.subscribe(
        StationFilter::To(station.to_string()),
        MessageType::GetBlockHeaders,
    );
    let mut body_reqs = router.subscribe(
        StationFilter::To(station.to_string()),
        MessageType::GetBlockBodies,
    );
    let by_hash: HashMap<Hash, usize> = blocks
        .iter()
        .enumerate()
        .map(|(index, block)| (block.hash(), index))
        .collect();
    let router = router.clone();
    let station = station.to_string();
    tokio::spawn(async move {
        loop {
            let (reply_to, payload) = tokio::select! {
                event = hash_reqs.recv() => {
                    let Some(Event { from: Some(from), payload: Payload::GetBlockHashes(req), .. }) = event else {
                        break;
                    };
                    (from, Payload::BlockHashes(walk_hashes(&blocks, &req, fault)))
                }
                event = header_reqs.recv() => {
                    let Some(Event { from: Some(from), payload: Payload::GetBlockHeaders(req), .. }) = event else {
                        break;
                    };
                    (from, Payload::BlockHeaders(walk_headers(&blocks, &req, fault)))
                }
                event = body_reqs.recv() => {
                    let Some(Event { from: Some(from), payload: Payload::GetBlockBodies(hashes), .. }) = event else {
                        break;
                    };
                    if fault == PeerFault::MuteBodies {
                        continue;
                    }
                    let bodies: Vec<Body> = hashes
                        .iter()
                        .filter_map(|hash| by_hash.get(hash))
                        .map(|&index| blocks[index].body.clone())
                        .collect();
                    (from, Payload::BlockBodies(bodies))
                }
            };
            if fault == PeerFault::Silent {
                continue;
            }
            router.send_to(Some(&station), &reply_to, payload);
        }
    });
}

/// A chain store that rejects the first `failures` insert batches, then
/// behaves normally.
pub struct FlakyChain {
    inner: Arc<MemoryChain>,
    failures: AtomicU32,
}

impl FlakyChain {
    pub fn new(inner: Arc<MemoryChain>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }
}

impl ChainStore for FlakyChain {
    fn current_head(&self) -> (Hash, u64) {
        self.inner.current_head()
    }

    fn total_difficulty(&self, hash: &Hash, number: u64) -> Option<Td> {
        self.inner.total_difficulty(hash, number)
    }

    fn has_block(&self, hash: &Hash, number: u64) -> bool {
        self.inner.has_block(hash, number)
    }

    fn insert_chain(&self, blocks: &[Block]) -> ChainResult<usize> {
        let remaining = self.failures.load(Ordering::Acquire);
        if remaining > 0
            && self
                .failures
                .compare_exchange(remaining, remaining - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Err(ember_chain::ChainError::Rejected {
                index: 0,
                height: blocks.first().map(Block::number).unwrap_or_default(),
                reason: "transient store failure".to_string(),
            });
        }
        self.inner.insert_chain(blocks)
    }
}

/// Everything a sync scenario needs: bus, local chain and the running
/// service.
pub struct SyncHarness {
    pub router: Router,
    pub chain: Arc<MemoryChain>,
    pub service: Arc<SyncService>,
}

impl SyncHarness {
    /// Test-friendly timings; semantics-bearing constants keep their
    /// defaults.
    pub fn config() -> SyncConfig {
        SyncConfig {
            request_timeout: Duration::from_millis(250),
            insert_retry_delay: Duration::from_millis(25),
            heartbeat: Duration::from_millis(500),
            ..SyncConfig::default()
        }
    }

    /// Start a service over a local chain seeded with `local`.
    pub fn start(local: &[Block]) -> Self {
        let chain = Arc::new(seed_chain(local));
        let store: Arc<dyn ChainStore> = Arc::clone(&chain) as Arc<dyn ChainStore>;
        Self::start_with(chain, store)
    }

    /// Start a service over an arbitrary store, keeping `chain` for
    /// assertions.
    pub fn start_with(chain: Arc<MemoryChain>, store: Arc<dyn ChainStore>) -> Self {
        let router = Router::new();
        let service = SyncService::spawn(router.clone(), store, Self::config());
        Self {
            router,
            chain,
            service,
        }
    }

    /// Spawn a scripted peer and register it with the engine under `name`.
    pub fn connect_peer(&self, name: &str, blocks: &[Block], fault: PeerFault) {
        self.connect_peer_claiming(name, blocks, fault, None);
    }

    /// Like [`connect_peer`](Self::connect_peer), but advertising a custom
    /// head instead of the served chain's real tip.
    pub fn connect_peer_claiming(
        &self,
        name: &str,
        blocks: &[Block],
        fault: PeerFault,
        claimed: Option<(Hash, u64, Td)>,
    ) {
        spawn_peer(&self.router, name, blocks.to_vec(), fault);
        let (hash, number, td) = claimed.unwrap_or_else(|| {
            let tip = blocks.last().expect("peer chain is never empty");
            (
                tip.hash(),
                tip.number(),
                generators::total_difficulty(blocks),
            )
        });
        self.service.register_peer(name, td, number, hash);
    }

    /// Remove a peer from both the engine and the bus fanout.
    pub fn disconnect_peer(&self, name: &str) {
        self.service.deregister_peer(name);
        self.router.deregister_remote(name);
    }

    /// Poll until the local head reaches `height` or the deadline passes.
    pub async fn wait_for_height(&self, height: u64, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if self.chain.head_number() >= height {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

/// A [`MemoryChain`] seeded with the given blocks (`local[0]` is genesis).
pub fn seed_chain(local: &[Block]) -> MemoryChain {
    let chain = MemoryChain::new(local[0].clone());
    if local.len() > 1 {
        chain.insert_chain(&local[1..]).expect("seed local chain");
    }
    chain
}
