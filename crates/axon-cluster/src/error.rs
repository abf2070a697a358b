//! Error types for axon-cluster.

use std::time::Duration;

use axon_clock::NodeId;
use thiserror::Error;

/// Result type for axon-cluster operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A node did not answer a fan-out query in time.
    #[error("node {node} did not answer within {after:?}")]
    DeadlineExceeded { node: NodeId, after: Duration },

    /// The search collaborator failed.
    #[error("search failed: {0}")]
    Search(String),

    #[error("invalid pattern report: {0}")]
    InvalidReport(String),

    #[error("store error: {0}")]
    Store(#[from] axon_crdt::Error),

    #[error("bus error: {0}")]
    Bus(#[from] axon_bus::Error),
}
