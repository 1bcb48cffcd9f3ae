//! Sync error types.

use thiserror::Error;

/// Errors raised inside the sync engine. All of them are contained: a failed
/// task is retried or its round aborted, and nothing propagates above the
/// sync loop.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No reply arrived within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The peer was deregistered while we were waiting on it.
    #[error("peer disconnected")]
    PeerGone,

    /// A reply failed a length, ordering or linkage check.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// The chain store rejected an insert.
    #[error("chain rejected insert at height {height}: {reason}")]
    ChainRejected { height: u64, reason: String },

    /// The registry has no peers to sync from.
    #[error("no peer available")]
    NoBestPeer,

    /// The best peer does not advertise more work than the local head.
    #[error("best peer does not exceed local total difficulty")]
    InsufficientWork,
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
