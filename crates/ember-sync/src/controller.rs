//! The top-level sync loop.
//!
//! A capacity-1 trigger coalesces wake-ups from gossip and peer
//! registration; a heartbeat timer forces a round even if a trigger is lost.
//! Each round picks the best peer, finds the common ancestor and runs one
//! bounded download, looping while rounds make progress.

use crate::ancestor::find_ancestor;
use crate::client::RequestClient;
use crate::dispatch::TaskDispatcher;
use crate::gossip::Gossiper;
use crate::status::{PeerRegistry, PeerStatus};
use crate::{SyncConfig, SyncError, SyncResult};
use ember_chain::ChainStore;
use ember_router::Router;
use ember_types::{Hash, Td};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The block-synchronization service. Owns the peer registry, ingests gossip
/// and drives download rounds until no peer advertises more work than the
/// local chain holds.
pub struct SyncService {
    chain: Arc<dyn ChainStore>,
    registry: Arc<PeerRegistry>,
    client: RequestClient,
    dispatcher: TaskDispatcher,
    trigger: mpsc::Sender<()>,
    config: SyncConfig,
    shutdown: CancellationToken,
}

impl SyncService {
    /// Create the service and spawn its gossip and control loops.
    pub fn spawn(
        router: Router,
        chain: Arc<dyn ChainStore>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let registry = Arc::new(PeerRegistry::new());
        let client = RequestClient::new(router.clone(), config.request_timeout);
        let dispatcher = TaskDispatcher::new(Arc::clone(&chain), client.clone(), config.clone());
        let shutdown = CancellationToken::new();

        let (announces, mined) = Gossiper::subscriptions(&router);
        let gossiper = Gossiper::new(
            router.clone(),
            Arc::clone(&chain),
            Arc::clone(&registry),
            trigger_tx.clone(),
            config.max_known_blocks,
            shutdown.clone(),
        );
        tokio::spawn(gossiper.run(announces, mined));

        let service = Arc::new(Self {
            chain,
            registry,
            client,
            dispatcher,
            trigger: trigger_tx,
            config,
            shutdown,
        });
        tokio::spawn(Arc::clone(&service).control_loop(trigger_rx));
        service
    }

    /// Track a newly connected peer. Wakes the sync loop when the peer
    /// advertises more work than the local head.
    pub fn register_peer(&self, station: &str, td: Td, number: u64, hash: Hash) {
        self.registry.insert(station, hash, number, td.clone());
        if td > self.local_td() {
            self.trigger();
        }
    }

    /// Drop a peer. Its disconnect signal wakes every request still waiting
    /// on it.
    pub fn deregister_peer(&self, station: &str) {
        self.registry.remove(station);
    }

    /// The peer registry, shared with the gossip loop.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Stop the gossip and control loops.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn trigger(&self) {
        // Capacity 1: concurrent triggers coalesce into one wake-up.
        let _ = self.trigger.try_send(());
    }

    fn local_td(&self) -> Td {
        let (hash, number) = self.chain.current_head();
        self.chain
            .total_difficulty(&hash, number)
            .unwrap_or_default()
    }

    async fn control_loop(self: Arc<Self>, mut trigger_rx: mpsc::Receiver<()>) {
        let heartbeat = self.config.heartbeat;
        let timer = tokio::time::sleep(heartbeat);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = trigger_rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                    self.download_loop().await;
                    timer.as_mut().reset(tokio::time::Instant::now() + heartbeat);
                }
                _ = &mut timer => {
                    self.trigger();
                    timer.as_mut().reset(tokio::time::Instant::now() + heartbeat);
                }
            }
        }
        debug!("sync loop stopped");
    }

    /// Run download rounds while they make progress.
    async fn download_loop(&self) {
        loop {
            let Some(best) = self.registry.best() else {
                debug!(err = %SyncError::NoBestPeer, "nothing to sync");
                break;
            };
            match self.download_round(&best).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(SyncError::InsufficientWork) => break,
                Err(err) => {
                    debug!(peer = best.station(), %err, "download round failed");
                    break;
                }
            }
        }
    }

    /// One round against `peer`: ancestor search, bounded download, ancestor
    /// advance. Returns whether the peer still leads afterwards.
    async fn download_round(&self, peer: &Arc<PeerStatus>) -> SyncResult<bool> {
        let head = peer.head();
        let local_td = self.local_td();
        if head.td <= local_td {
            return Err(SyncError::InsufficientWork);
        }

        let (local_hash, local_number) = self.chain.current_head();
        let cancel = peer.disconnect_token();
        let ceiling = local_number.min(head.number);
        let floor = peer.ancestor().saturating_add(1);
        let ancestor = find_ancestor(
            self.chain.as_ref(),
            &self.client,
            peer.station(),
            &cancel,
            ceiling,
            floor,
            self.config.ancestor_probe_cap,
        )
        .await?;

        let amount = head.number.saturating_sub(ancestor);
        if amount == 0 {
            debug!(
                peer = peer.station(),
                local_number,
                peer_number = head.number,
                ancestor,
                local_hash = %local_hash,
                peer_hash = %head.hash,
                local_td = %local_td,
                peer_td = %head.td,
                "peer advertises more work but nothing to download"
            );
            return Ok(false);
        }
        let start = ancestor + 1;
        let end = ancestor + amount.min(self.config.round_cap);
        let workers = self.registry.workers(&local_td);
        info!(
            peer = peer.station(),
            start,
            end,
            ancestor,
            workers = workers.len(),
            "download round starting"
        );

        let result = self.dispatcher.run_round(peer, start, end, workers).await?;
        peer.set_ancestor(result.ancestor);
        if let Some(err) = result.error {
            warn!(
                peer = peer.station(),
                ancestor = result.ancestor,
                %err,
                "round ended early on insert failure"
            );
        } else {
            info!(
                peer = peer.station(),
                ancestor = result.ancestor,
                "download round finished"
            );
        }

        Ok(head.td > self.local_td())
    }
}
