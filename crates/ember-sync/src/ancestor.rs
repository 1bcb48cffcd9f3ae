//! Common-ancestor search against a single remote peer.
//!
//! Two phases: a bulk probe of the remote chain's newest hashes, walked from
//! the tip downward, and, if nothing matched, a binary search over a
//! progressively widening window. A probe that straddles the have /
//! have-not boundary ends the search immediately.

use crate::client::RequestClient;
use crate::{SyncError, SyncResult};
use ember_chain::ChainStore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Highest height at which the local chain and `peer` share a block hash.
///
/// `head` is the probe ceiling (the lower of the local and remote heads) and
/// `floor` the first height worth probing, one past the last proven
/// ancestor. Returns 0 when only the genesis block is shared.
pub(crate) async fn find_ancestor(
    chain: &dyn ChainStore,
    client: &RequestClient,
    peer: &str,
    cancel: &CancellationToken,
    head: u64,
    floor: u64,
    probe_cap: u64,
) -> SyncResult<u64> {
    if head < 1 {
        return Ok(0);
    }
    let mut head = head;
    let mut floor = floor;

    // Bulk tail probe: the remote chain's newest hashes, tip first. A reply
    // longer than the request would walk past height zero below.
    let length = head.saturating_sub(floor).saturating_add(2).min(probe_cap);
    let hashes = client
        .get_hashes(peer, cancel, head, length, 0, true)
        .await?;
    if hashes.len() as u64 > length {
        return Err(SyncError::MalformedReply(format!(
            "tail probe returned {} hashes, asked for {length}",
            hashes.len()
        )));
    }
    for (i, hash) in hashes.iter().enumerate() {
        let number = head - i as u64;
        if chain.has_block(hash, number) {
            debug!(peer, number, "ancestor found in tail probe");
            return Ok(number);
        }
    }
    head = head.saturating_sub(hashes.len() as u64);
    floor /= 2;

    while head > 0 {
        let span = head.saturating_sub(floor) + 1;
        // Smallest offset whose remote block the local chain lacks.
        let mut lo = 0u64;
        let mut hi = span;
        let mut boundary = None;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let number = floor + mid;
            let hashes = client.get_hashes(peer, cancel, number, 2, 0, false).await?;
            let first = hashes.first().ok_or_else(|| {
                SyncError::MalformedReply(format!("empty hash reply probing height {number}"))
            })?;
            let has_first = chain.has_block(first, number);
            if hashes.len() == 2 && has_first && !chain.has_block(&hashes[1], number + 1) {
                boundary = Some(number);
                break;
            }
            if has_first {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if let Some(number) = boundary {
            debug!(peer, number, "ancestor pinned by probe boundary");
            return Ok(number);
        }
        if lo > 0 {
            let number = floor + lo - 1;
            debug!(peer, number, "ancestor found by binary search");
            return Ok(number);
        }
        // Even the window floor is unknown; widen downward.
        head = floor.saturating_sub(1);
        floor /= 2;
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_chain::MemoryChain;
    use ember_router::{Event, MessageType, Payload, Router, StationFilter};
    use ember_types::{Block, Hash, Header};
    use std::time::Duration;

    fn block(parent: &Block, seed: u64) -> Block {
        Block::from_header(Header {
            parent_hash: parent.hash(),
            number: parent.number() + 1,
            difficulty: 1,
            transactions_root: Hash::ZERO,
            timestamp: seed,
        })
    }

    fn genesis() -> Block {
        Block::from_header(Header {
            parent_hash: Hash::ZERO,
            number: 0,
            difficulty: 1,
            transactions_root: Hash::ZERO,
            timestamp: 0,
        })
    }

    /// Chain of `len + 1` blocks (genesis included), forked from `base` at
    /// `fork_at` by switching the seed.
    fn chain_with_fork(base_seed: u64, fork_seed: u64, fork_at: u64, len: u64) -> Vec<Block> {
        let mut blocks = vec![genesis()];
        for number in 1..=len {
            let seed = if number <= fork_at { base_seed } else { fork_seed };
            let next = block(&blocks[blocks.len() - 1], seed);
            blocks.push(next);
        }
        blocks
    }

    /// Serve hash requests for a fixed chain under the station name `peer`,
    /// padding every reply with `extra` junk hashes beyond what was asked.
    fn serve_hashes(router: &Router, station: &str, blocks: Vec<Block>, extra: usize) {
        let mut requests = router.subscribe(
            StationFilter::To(station.to_string()),
            MessageType::GetBlockHashes,
        );
        let router = router.clone();
        let station = station.to_string();
        tokio::spawn(async move {
            while let Some(event) = requests.recv().await {
                let Event {
                    from: Some(from),
                    payload: Payload::GetBlockHashes(req),
                    ..
                } = event
                else {
                    continue;
                };
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
                for junk in 0..extra {
                    out.push(Hash::new([0xee ^ junk as u8; 32]));
                }
                router.send_to(Some(&station), &from, Payload::BlockHashes(out));
            }
        });
    }

    fn local_chain(blocks: &[Block]) -> MemoryChain {
        let chain = MemoryChain::new(blocks[0].clone());
        chain.insert_chain(&blocks[1..]).expect("seed local chain");
        chain
    }

    async fn run_search(
        local: Vec<Block>,
        remote: Vec<Block>,
        head: u64,
        floor: u64,
    ) -> SyncResult<u64> {
        let router = Router::new();
        serve_hashes(&router, "peer", remote, 0);
        let chain = local_chain(&local);
        let client = RequestClient::new(router.clone(), Duration::from_millis(100));
        let cancel = CancellationToken::new();
        find_ancestor(&chain, &client, "peer", &cancel, head, floor, 32).await
    }

    #[tokio::test]
    async fn shared_tip_is_found_in_the_tail_probe() {
        // Remote strictly extends the local chain; the probe's first hit is
        // the local head.
        let remote = chain_with_fork(1, 1, 100, 150);
        let local = remote[..=100].to_vec();
        let found = run_search(local, remote, 100, 1).await.expect("search");
        assert_eq!(found, 100);
    }

    #[tokio::test]
    async fn shallow_fork_is_found_in_the_tail_probe() {
        // Fork within the 32-hash probe window.
        let remote = chain_with_fork(1, 2, 90, 150);
        let local = chain_with_fork(1, 3, 90, 100);
        let found = run_search(local, remote, 100, 1).await.expect("search");
        assert_eq!(found, 90);
    }

    #[tokio::test]
    async fn deep_fork_falls_back_to_binary_search() {
        // Fork below the probe window: heights 69..=100 all differ.
        let remote = chain_with_fork(1, 2, 60, 150);
        let local = chain_with_fork(1, 3, 60, 100);
        let found = run_search(local, remote, 100, 1).await.expect("search");
        assert_eq!(found, 60);
    }

    #[tokio::test]
    async fn disjoint_chains_share_only_genesis() {
        let remote = chain_with_fork(1, 2, 0, 120);
        let local = chain_with_fork(3, 3, 0, 80);
        let found = run_search(local, remote, 80, 1).await.expect("search");
        assert_eq!(found, 0);
    }

    #[tokio::test]
    async fn oversized_probe_reply_is_malformed() {
        // The peer pads every reply; even a chain we fully share must be
        // rejected before any height arithmetic happens.
        let remote = chain_with_fork(1, 1, 100, 150);
        let local = remote[..=100].to_vec();
        let router = Router::new();
        serve_hashes(&router, "peer", remote, 4);
        let chain = local_chain(&local);
        let client = RequestClient::new(router.clone(), Duration::from_millis(100));
        let cancel = CancellationToken::new();

        let err = find_ancestor(&chain, &client, "peer", &cancel, 100, 1, 32)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedReply(_)));
    }

    #[tokio::test]
    async fn zero_head_needs_no_probe() {
        // No peer is serving requests; the search must not issue any.
        let router = Router::new();
        let chain = local_chain(&[genesis()]);
        let client = RequestClient::new(router.clone(), Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let found = find_ancestor(&chain, &client, "peer", &cancel, 0, 1, 32)
            .await
            .expect("trivial search");
        assert_eq!(found, 0);
    }
}
