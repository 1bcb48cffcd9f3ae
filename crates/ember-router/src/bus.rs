//! The bus itself: subscriptions, unicast delivery and remote fanout.

use crate::{MessageType, Payload, SUBSCRIPTION_BUFFER};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A delivered event: payload plus routing metadata.
#[derive(Debug, Clone)]
pub struct Event {
    /// Name of the sending station, when known.
    pub from: Option<String>,
    /// Destination station. `None` means the event was published locally for
    /// any interested subscriber.
    pub to: Option<String>,
    pub payload: Payload,
}

/// What a subscription listens to, besides the typecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationFilter {
    /// Events published without a destination.
    Any,
    /// Events addressed to the named station.
    To(String),
}

struct SubEntry {
    id: u64,
    filter: StationFilter,
    code: MessageType,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct RouterInner {
    subs: RwLock<Vec<SubEntry>>,
    remotes: RwLock<HashSet<String>>,
    next_id: AtomicU64,
}

/// The process-wide event bus. A `Router` is a cheap handle; clones share
/// the same bus.
#[derive(Clone, Default)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a remote station so broadcasts reach it.
    pub fn register_remote(&self, station: &str) {
        self.inner.remotes.write().insert(station.to_string());
        debug!(station, "remote station registered");
    }

    /// Remove a remote station from broadcast fanout.
    pub fn deregister_remote(&self, station: &str) {
        self.inner.remotes.write().remove(station);
        debug!(station, "remote station deregistered");
    }

    /// Names of all currently registered remote stations.
    pub fn remote_stations(&self) -> Vec<String> {
        self.inner.remotes.read().iter().cloned().collect()
    }

    /// Subscribe to events of `code` matching `filter`. Dropping the returned
    /// subscription unsubscribes.
    pub fn subscribe(&self, filter: StationFilter, code: MessageType) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subs.write().push(SubEntry {
            id,
            filter,
            code,
            tx,
        });
        Subscription {
            router: self.clone(),
            id,
            rx,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.subs.write().retain(|entry| entry.id != id);
    }

    /// Publish a destination-less event to any-station subscribers.
    pub fn publish(&self, from: Option<&str>, payload: Payload) {
        self.deliver(Event {
            from: from.map(str::to_string),
            to: None,
            payload,
        });
    }

    /// Send a unicast message to the named station.
    pub fn send_to(&self, from: Option<&str>, to: &str, payload: Payload) {
        self.deliver(Event {
            from: from.map(str::to_string),
            to: Some(to.to_string()),
            payload,
        });
    }

    /// Fan a message out to every registered remote station.
    pub fn broadcast(&self, from: Option<&str>, payload: Payload) {
        for station in self.remote_stations() {
            self.send_to(from, &station, payload.clone());
        }
    }

    fn deliver(&self, event: Event) {
        let code = event.payload.message_type();
        let subs = self.inner.subs.read();
        for entry in subs.iter().filter(|entry| entry.code == code) {
            let matches = match (&entry.filter, &event.to) {
                (StationFilter::Any, None) => true,
                (StationFilter::To(station), Some(to)) => station == to,
                _ => false,
            };
            if !matches {
                continue;
            }
            if entry.tx.try_send(event.clone()).is_err() {
                trace!(?code, sub = entry.id, "subscriber lagging or gone, event dropped");
            }
        }
    }
}

/// A live subscription. Receives matching events until dropped.
pub struct Subscription {
    router: Router,
    id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Next matching event; `None` once the subscription is defunct.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking poll for an already-buffered event.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.router.unsubscribe(self.id);
    }
}
