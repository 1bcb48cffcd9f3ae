//! Peer status records and the registry.

use ember_types::{Hash, Td};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Last-advertised head of a remote peer.
#[derive(Debug, Clone)]
pub struct PeerHead {
    pub hash: Hash,
    pub number: u64,
    pub td: Td,
}

/// Everything the engine tracks about one remote peer.
pub struct PeerStatus {
    /// Station name used to address the peer on the bus.
    station: String,
    /// Last advertised head triple.
    head: RwLock<PeerHead>,
    /// Highest height proven to be shared with the local chain. Zero until
    /// an ancestor search has succeeded.
    ancestor: AtomicU64,
    /// Fired exactly once, at deregistration. Every outstanding request
    /// against this peer races it.
    disconnect: CancellationToken,
}

impl PeerStatus {
    fn new(station: String, hash: Hash, number: u64, td: Td) -> Self {
        Self {
            station,
            head: RwLock::new(PeerHead { hash, number, td }),
            ancestor: AtomicU64::new(0),
            disconnect: CancellationToken::new(),
        }
    }

    pub fn station(&self) -> &str {
        &self.station
    }

    /// Snapshot of the advertised head.
    pub fn head(&self) -> PeerHead {
        self.head.read().clone()
    }

    pub fn update_head(&self, hash: Hash, number: u64, td: Td) {
        let mut head = self.head.write();
        head.hash = hash;
        head.number = number;
        head.td = td;
    }

    pub fn ancestor(&self) -> u64 {
        self.ancestor.load(Ordering::Acquire)
    }

    pub fn set_ancestor(&self, number: u64) {
        self.ancestor.store(number, Ordering::Release);
    }

    /// Token that fires when the peer is deregistered. Cheap to clone; all
    /// clones observe the same signal.
    pub fn disconnect_token(&self) -> CancellationToken {
        self.disconnect.clone()
    }
}

/// Registry of known remote peers, keyed by station name. Reads are shared,
/// mutation is exclusive; no lock is held across any await point.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Arc<PeerStatus>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a peer record.
    pub fn insert(&self, station: &str, hash: Hash, number: u64, td: Td) -> Arc<PeerStatus> {
        let status = Arc::new(PeerStatus::new(station.to_string(), hash, number, td));
        self.peers
            .write()
            .insert(station.to_string(), Arc::clone(&status));
        debug!(peer = station, number, "peer registered");
        status
    }

    /// Remove a peer and raise its disconnect signal, waking every request
    /// still waiting on it.
    pub fn remove(&self, station: &str) -> Option<Arc<PeerStatus>> {
        let removed = self.peers.write().remove(station);
        if let Some(status) = &removed {
            status.disconnect.cancel();
            debug!(peer = station, "peer removed, disconnect raised");
        }
        removed
    }

    pub fn get(&self, station: &str) -> Option<Arc<PeerStatus>> {
        self.peers.read().get(station).cloned()
    }

    /// The peer advertising the greatest total difficulty. Ties break on the
    /// station name so the choice is deterministic.
    pub fn best(&self) -> Option<Arc<PeerStatus>> {
        let peers = self.peers.read();
        peers
            .values()
            .max_by(|a, b| {
                (a.head().td, &a.station).cmp(&(b.head().td, &b.station))
            })
            .cloned()
    }

    /// Peers advertising strictly more work than `floor`, for use as round
    /// workers.
    pub fn workers(&self, floor: &Td) -> Vec<Arc<PeerStatus>> {
        self.peers
            .read()
            .values()
            .filter(|status| status.head().td > *floor)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
