//! Helpers for multi-node tests: an in-process cluster of [`Node`]s that
//! share one [`MemoryNetwork`] and one [`MemorySearch`].

use std::sync::Arc;

use axon_clock::NodeId;
use axon_cluster::{MemorySearch, ShardedConnectionCounters};
use axon_node::{Node, NodeConfig, Result};
use axon_sync::MemoryNetwork;

pub struct TestCluster {
    pub network: Arc<MemoryNetwork>,
    pub search: Arc<MemorySearch>,
    pub telemetry: Arc<ShardedConnectionCounters>,
    pub nodes: Vec<Node>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            search: Arc::new(MemorySearch::new()),
            telemetry: Arc::new(ShardedConnectionCounters::default()),
            nodes: Vec::new(),
        }
    }

    /// Start nodes with default configuration.
    pub async fn with_nodes(ids: &[&str]) -> Result<Self> {
        let mut cluster = Self::new();
        for id in ids {
            cluster.add(NodeConfig::new(NodeId::new(*id)?)).await?;
        }
        Ok(cluster)
    }

    pub async fn add(&mut self, config: NodeConfig) -> Result<&Node> {
        let node = Node::join_memory(&self.network, config, self.search.clone(), self.telemetry.clone()).await?;
        self.nodes.push(node);
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    pub fn node(&self, id: &str) -> &Node {
        self.nodes
            .iter()
            .find(|n| n.node_id().as_str() == id)
            .unwrap_or_else(|| panic!("no node {id} in the test cluster"))
    }

    /// Discover, heartbeat, then enable sync everywhere.
    pub async fn ready(&self) -> Result<()> {
        for node in &self.nodes {
            node.monitor().discover_peers().await?;
        }
        for node in &self.nodes {
            node.monitor().heartbeat().await;
        }
        for node in &self.nodes {
            node.monitor().enable_sync().await?;
        }
        Ok(())
    }

    /// One round from every node, in order.
    pub async fn sync_all(&self) -> Result<()> {
        for node in &self.nodes {
            node.monitor().sync_with_peers().await?;
        }
        Ok(())
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}
