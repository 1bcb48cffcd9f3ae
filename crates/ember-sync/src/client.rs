//! Typed request/response over the event bus.
//!
//! Every request follows the same shape: open a reply subscription on a fresh
//! station, send the request to the peer, wait for the matching reply. The
//! wait is bounded by the request timeout and terminates early when the
//! peer's disconnect signal fires.

use crate::{SyncError, SyncResult};
use ember_router::{
    HashRequest, HeaderAnchor, HeaderRequest, MessageType, Payload, Router, StationFilter,
};
use ember_types::{Body, Hash, Header};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

static REPLY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Issues typed requests to peer stations and waits for the matching reply.
/// Cheap to clone; one instance is shared across all download tasks.
#[derive(Clone)]
pub struct RequestClient {
    router: Router,
    timeout: Duration,
}

impl RequestClient {
    pub fn new(router: Router, timeout: Duration) -> Self {
        Self { router, timeout }
    }

    /// `amount` block hashes starting at `number`, stepping `skip + 1`,
    /// descending when `reverse` is set.
    pub async fn get_hashes(
        &self,
        peer: &str,
        cancel: &CancellationToken,
        number: u64,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> SyncResult<Vec<Hash>> {
        let request = Payload::GetBlockHashes(HashRequest {
            number,
            amount,
            skip,
            reverse,
        });
        match self
            .exchange(peer, cancel, request, MessageType::BlockHashes)
            .await?
        {
            Payload::BlockHashes(hashes) => Ok(hashes),
            other => Err(unexpected(MessageType::BlockHashes, &other)),
        }
    }

    /// `amount` headers starting at height `number`, same stride semantics.
    pub async fn get_headers(
        &self,
        peer: &str,
        cancel: &CancellationToken,
        number: u64,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> SyncResult<Vec<Header>> {
        let request = Payload::GetBlockHeaders(HeaderRequest {
            start: HeaderAnchor::Number(number),
            amount,
            skip,
            reverse,
        });
        match self
            .exchange(peer, cancel, request, MessageType::BlockHeaders)
            .await?
        {
            Payload::BlockHeaders(headers) => Ok(headers),
            other => Err(unexpected(MessageType::BlockHeaders, &other)),
        }
    }

    /// Bodies for `hashes`, in request order.
    pub async fn get_bodies(
        &self,
        peer: &str,
        cancel: &CancellationToken,
        hashes: Vec<Hash>,
    ) -> SyncResult<Vec<Body>> {
        let request = Payload::GetBlockBodies(hashes);
        match self
            .exchange(peer, cancel, request, MessageType::BlockBodies)
            .await?
        {
            Payload::BlockBodies(bodies) => Ok(bodies),
            other => Err(unexpected(MessageType::BlockBodies, &other)),
        }
    }

    async fn exchange(
        &self,
        peer: &str,
        cancel: &CancellationToken,
        request: Payload,
        reply: MessageType,
    ) -> SyncResult<Payload> {
        let station = format!("sync.reply.{}", REPLY_SEQ.fetch_add(1, Ordering::Relaxed));
        let mut sub = self
            .router
            .subscribe(StationFilter::To(station.clone()), reply);
        self.router.send_to(Some(&station), peer, request);

        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::PeerGone),
            received = tokio::time::timeout(self.timeout, sub.recv()) => match received {
                Err(_) => Err(SyncError::Timeout),
                Ok(None) => Err(SyncError::PeerGone),
                Ok(Some(event)) => Ok(event.payload),
            },
        }
    }
}

fn unexpected(wanted: MessageType, got: &Payload) -> SyncError {
    SyncError::MalformedReply(format!(
        "expected {:?} payload, got {:?}",
        wanted,
        got.message_type()
    ))
}
