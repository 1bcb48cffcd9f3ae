//! # ember-sync
//!
//! Block synchronization engine. Watches gossip for peers advertising a chain
//! of greater cumulative difficulty, locates the most recent common ancestor
//! with the best such peer, and downloads the missing blocks in parallel
//! chunks, validating that every delivered fragment stitches into one
//! contiguous, hash-linked sequence before insertion.
//!
//! This crate provides:
//! - Peer registry with last-advertised heads and disconnect signalling
//! - Deduplicating head-announcement gossip
//! - Typed request/response over the event bus with timeouts
//! - Bulk-probe plus binary-search ancestor location
//! - Skeleton-bounded multiplexed block download
//! - The top-level sync loop

mod ancestor;
mod client;
mod controller;
mod dispatch;
mod error;
mod gossip;
mod status;

pub use client::RequestClient;
pub use controller::SyncService;
pub use error::{SyncError, SyncResult};
pub use gossip::KnownHashes;
pub use status::{PeerHead, PeerRegistry, PeerStatus};

use std::time::Duration;

/// Maximum block hashes kept in the gossip dedup set.
pub const MAX_KNOWN_BLOCKS: usize = 1024;

/// How long a request waits for its reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum blocks downloaded in one round.
pub const ROUND_CAP: u64 = 1024;

/// Distance between skeleton sample points.
pub const SKELETON_STRIDE: u64 = 64;

/// Maximum download tasks in flight at once.
pub const MAX_PARALLEL_TASKS: usize = 16;

/// Failures a single task may accumulate before the round aborts.
pub const TASK_ERROR_BUDGET: u32 = 5;

/// Pause before the single insert retry.
pub const INSERT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Idle interval after which a download round is forced.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum hashes requested by the bulk ancestor probe.
pub const ANCESTOR_PROBE_CAP: u64 = 32;

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Per-request reply timeout.
    pub request_timeout: Duration,
    /// Blocks per download round.
    pub round_cap: u64,
    /// Skeleton sampling stride.
    pub skeleton_stride: u64,
    /// Concurrent download tasks.
    pub max_parallel_tasks: usize,
    /// Per-task error budget.
    pub task_error_budget: u32,
    /// Sleep before retrying a failed insert.
    pub insert_retry_delay: Duration,
    /// Heartbeat interval of the sync loop.
    pub heartbeat: Duration,
    /// Capacity of the gossip dedup set.
    pub max_known_blocks: usize,
    /// Bulk ancestor probe cap.
    pub ancestor_probe_cap: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: REQUEST_TIMEOUT,
            round_cap: ROUND_CAP,
            skeleton_stride: SKELETON_STRIDE,
            max_parallel_tasks: MAX_PARALLEL_TASKS,
            task_error_budget: TASK_ERROR_BUDGET,
            insert_retry_delay: INSERT_RETRY_DELAY,
            heartbeat: HEARTBEAT_INTERVAL,
            max_known_blocks: MAX_KNOWN_BLOCKS,
            ancestor_probe_cap: ANCESTOR_PROBE_CAP,
        }
    }
}
