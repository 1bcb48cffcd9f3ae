//! Status gossip: head announcements in, deduplicated re-broadcast out.

use crate::status::PeerRegistry;
use ember_chain::ChainStore;
use ember_router::{Event, MessageType, Payload, Router, StationFilter, Subscription};
use ember_types::{Hash, HeadAnnounce, Td};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A bounded FIFO set of recently gossiped block hashes. When full, the
/// oldest entry is evicted to make room. Lookups are O(1) via a `HashSet`.
pub struct KnownHashes {
    set: HashSet<Hash>,
    order: VecDeque<Hash>,
    capacity: usize,
}

impl KnownHashes {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a hash, evicting the oldest entries while at capacity.
    pub fn insert(&mut self, hash: Hash) {
        if self.capacity == 0 || self.set.contains(&hash) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.set.insert(hash);
        self.order.push_back(hash);
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.set.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Ingests head announcements and locally mined blocks, keeps the registry
/// current, wakes the sync loop when a peer pulls ahead and re-broadcasts
/// fresh news to every peer.
pub(crate) struct Gossiper {
    router: Router,
    chain: Arc<dyn ChainStore>,
    registry: Arc<PeerRegistry>,
    trigger: mpsc::Sender<()>,
    known: KnownHashes,
    /// Highest block number ever seen in a gossip message. Monotone.
    max_seen: u64,
    shutdown: CancellationToken,
}

impl Gossiper {
    pub(crate) fn new(
        router: Router,
        chain: Arc<dyn ChainStore>,
        registry: Arc<PeerRegistry>,
        trigger: mpsc::Sender<()>,
        max_known_blocks: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            router,
            chain,
            registry,
            trigger,
            known: KnownHashes::new(max_known_blocks),
            max_seen: 0,
            shutdown,
        }
    }

    /// Open the gossip subscriptions. Done before the loop is spawned so no
    /// announcement can slip through in between.
    pub(crate) fn subscriptions(router: &Router) -> (Subscription, Subscription) {
        (
            router.subscribe(StationFilter::Any, MessageType::NewBlockHashes),
            router.subscribe(StationFilter::Any, MessageType::NewMinedBlock),
        )
    }

    pub(crate) async fn run(
        mut self,
        mut announces: Subscription,
        mut mined: Subscription,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = announces.recv() => {
                    let Some(event) = event else { break };
                    self.on_announce(event);
                }
                event = mined.recv() => {
                    let Some(event) = event else { break };
                    self.on_mined(event);
                }
            }
        }
        debug!("gossip loop stopped");
    }

    fn local_td(&self) -> Td {
        let (hash, number) = self.chain.current_head();
        self.chain
            .total_difficulty(&hash, number)
            .unwrap_or_default()
    }

    fn on_mined(&mut self, event: Event) {
        let Payload::NewMinedBlock(block) = event.payload else {
            return;
        };
        let hash = block.hash();
        let number = block.number();
        let Some(td) = self.chain.total_difficulty(&hash, number) else {
            debug!(%hash, number, "mined block unknown to the chain store, not announcing");
            return;
        };
        self.broadcast_head(HeadAnnounce { hash, number, td });
    }

    fn on_announce(&mut self, event: Event) {
        let Payload::NewBlockHashes(announce) = event.payload else {
            return;
        };
        if let Some(from) = event.from.as_deref() {
            if let Some(status) = self.registry.get(from) {
                status.update_head(announce.hash, announce.number, announce.td.clone());
            }
        }
        if announce.td > self.local_td() {
            let _ = self.trigger.try_send(());
            self.broadcast_head(announce);
        }
    }

    /// Forward an announcement to all peers unless it has already passed
    /// through here.
    fn broadcast_head(&mut self, announce: HeadAnnounce) {
        if announce.number <= self.max_seen && self.known.contains(&announce.hash) {
            trace!(hash = %announce.hash, number = announce.number, "announcement already forwarded");
            return;
        }
        self.known.insert(announce.hash);
        self.max_seen = self.max_seen.max(announce.number);
        self.router
            .broadcast(None, Payload::NewBlockHashes(announce));
    }
}
