//! Axon Node - one process of the Axon cluster
//!
//! Wires the clock, event bus, CRDT store, sync monitor, algedonic
//! escalator and cluster aggregator into a [`Node`], configured from
//! `AXON_*` environment variables through [`NodeConfig::from_env`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use axon_cluster::{MemorySearch, ShardedConnectionCounters};
//! use axon_node::{Node, NodeConfig};
//! use axon_sync::MemoryNetwork;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let config = NodeConfig::from_env()?;
//!     let mut node = Node::join_memory(
//!         &network,
//!         config,
//!         Arc::new(MemorySearch::new()),
//!         Arc::new(ShardedConnectionCounters::default()),
//!     )
//!     .await?;
//!     node.spawn_background()?;
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod node;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use node::{Collaborators, Node};
