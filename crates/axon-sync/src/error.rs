//! Error types for axon-sync.

use std::fmt;
use std::time::Duration;

use axon_clock::NodeId;
use thiserror::Error;

/// Result type for axon-sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why the safety check refused to enable sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyViolation {
    InsufficientPeers { required: usize, reachable: usize },
    ClockDrift { drift_ms: u64, max_ms: u64 },
    StoreIntegrity { issues: Vec<(String, String)> },
}

impl fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientPeers { required, reachable } => write!(
                f,
                "{reachable} reachable peer(s), at least {required} required; \
                 run discover_peers() and heartbeat() first, or lower min_peers"
            ),
            Self::ClockDrift { drift_ms, max_ms } => write!(
                f,
                "local clock runs {drift_ms}ms ahead of wall time (limit {max_ms}ms); \
                 check NTP on this host and on the peer that sent the skewed timestamp"
            ),
            Self::StoreIntegrity { issues } => {
                write!(f, "{} object(s) failed the integrity check", issues.len())?;
                if let Some((id, problem)) = issues.first() {
                    write!(f, " (first: {id}: {problem})")?;
                }
                write!(f, "; inspect the store before replicating it")
            }
        }
    }
}

/// Errors that can occur in the sync monitor.
#[derive(Debug, Error)]
pub enum Error {
    /// The safety check failed; sync stays disabled.
    #[error("safety check failed: {0}")]
    SafetyCheckFailed(SafetyViolation),

    /// Sync is turned off on this node.
    #[error("sync is disabled; call enable_sync() once the safety check can pass")]
    SyncDisabled,

    /// The transport could not reach the peer.
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: NodeId, reason: String },

    /// The peer did not answer in time.
    #[error("peer {peer} did not answer within {after:?}")]
    DeadlineExceeded { peer: NodeId, after: Duration },

    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error("no peers known")]
    NoPeers,

    /// The peer answered with something that does not fit the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(#[from] axon_crdt::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}
