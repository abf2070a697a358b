//! Error types for axon-node.

use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An `AXON_*` variable could not be parsed.
    #[error("invalid {var}={value:?}: {reason}")]
    Config {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    NodeId(#[from] axon_clock::InvalidNodeId),

    #[error("bus error: {0}")]
    Bus(#[from] axon_bus::Error),

    #[error("store error: {0}")]
    Store(#[from] axon_crdt::Error),

    #[error("sync error: {0}")]
    Sync(#[from] axon_sync::Error),

    #[error("cluster error: {0}")]
    Cluster(#[from] axon_cluster::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
