//! One Axon node: clock, bus, store, sync monitor, escalator and
//! aggregator wired together.

use std::sync::Arc;

use axon_bus::{AlgedonicEscalator, EventBus};
use axon_clock::{Hlc, NodeId};
use axon_cluster::{ClusterAggregator, ConnectionTelemetry, SearchBackend};
use axon_crdt::CrdtStore;
use axon_sync::{Discovery, MemoryNetwork, PeerTransport, SyncMonitor};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::NodeConfig;
use crate::error::Result;

/// External collaborators a node needs.
pub struct Collaborators {
    pub transport: Arc<dyn PeerTransport>,
    pub discovery: Arc<dyn Discovery>,
    pub search: Arc<dyn SearchBackend>,
    pub telemetry: Arc<dyn ConnectionTelemetry>,
}

pub struct Node {
    config: NodeConfig,
    bus: EventBus,
    store: CrdtStore,
    monitor: Arc<SyncMonitor>,
    escalator: AlgedonicEscalator,
    aggregator: Arc<ClusterAggregator>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Build a node. Background loops are not started; see
    /// [`spawn_background`](Self::spawn_background).
    pub async fn new(config: NodeConfig, collaborators: Collaborators) -> Result<Self> {
        let hlc = Arc::new(Hlc::new(config.node_id.clone()));
        let bus = EventBus::with_config(hlc, config.bus.clone());
        let store = CrdtStore::with_config(bus.clone(), config.store.clone());
        let monitor = Arc::new(SyncMonitor::new(
            store.clone(),
            collaborators.transport,
            collaborators.discovery,
            config.sync.clone(),
        ));
        let escalator = AlgedonicEscalator::new(bus.clone(), config.escalator)?;
        let aggregator = ClusterAggregator::new(
            Arc::clone(&monitor),
            collaborators.search,
            collaborators.telemetry,
            config.aggregator.clone(),
        )
        .await?;
        let (shutdown, _) = watch::channel(false);

        info!(node = %config.node_id, "node ready");
        Ok(Self {
            config,
            bus,
            store,
            monitor,
            escalator,
            aggregator: Arc::new(aggregator),
            shutdown,
            tasks: Vec::new(),
        })
    }

    /// Build a node attached to an in-process network.
    pub async fn join_memory(
        network: &Arc<MemoryNetwork>,
        config: NodeConfig,
        search: Arc<dyn SearchBackend>,
        telemetry: Arc<dyn ConnectionTelemetry>,
    ) -> Result<Self> {
        let transport = Arc::new(network.transport(config.node_id.clone()));
        let node_id = config.node_id.clone();
        let node = Self::new(
            config,
            Collaborators {
                transport: transport.clone(),
                discovery: transport,
                search,
                telemetry,
            },
        )
        .await?;
        network.register(node_id, node.monitor.handler());
        Ok(node)
    }

    /// Start the sync monitor and aggregator loops.
    pub fn spawn_background(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            return Ok(());
        }
        let subscriber = self.aggregator.subscribe()?;
        self.tasks.push(tokio::spawn(
            Arc::clone(&self.monitor).run(self.shutdown.subscribe()),
        ));
        self.tasks.push(tokio::spawn(
            Arc::clone(&self.aggregator).run(subscriber, self.shutdown.subscribe()),
        ));
        Ok(())
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &CrdtStore {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<SyncMonitor> {
        &self.monitor
    }

    pub fn escalator(&self) -> &AlgedonicEscalator {
        &self.escalator
    }

    pub fn aggregator(&self) -> &Arc<ClusterAggregator> {
        &self.aggregator
    }

    /// Stop background loops, then close the bus.
    pub async fn shutdown(self) -> Result<()> {
        self.monitor.disable_sync();
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await?;
        }
        self.bus.close();
        info!(node = %self.config.node_id, "node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_bus::{SignalKind, Topic};
    use axon_cluster::{MemorySearch, PatternMatch, ShardedConnectionCounters};
    use std::time::Duration;

    async fn node(network: &Arc<MemoryNetwork>, id: &str) -> Node {
        let config = NodeConfig::new(NodeId::new(id).unwrap());
        Node::join_memory(
            network,
            config,
            Arc::new(MemorySearch::new()),
            Arc::new(ShardedConnectionCounters::default()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn background_loops_report_and_stop() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "a").await;
        a.spawn_background().unwrap();

        let indexed = a.bus().subscribe(Topic::PatternIndexed).unwrap();
        a.bus()
            .publish_json(
                Topic::PatternMatched,
                &PatternMatch {
                    node_id: NodeId::new("a").unwrap(),
                    pattern_id: "spike".to_string(),
                    vector: None,
                },
            )
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), indexed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(a.aggregator().record("spike").is_some());

        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn escalator_uses_configured_threshold() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a").await;
        assert_eq!(a.escalator().threshold(), 0.8);
        assert!(a
            .escalator()
            .signal(SignalKind::Pain, 0.9, "test")
            .unwrap()
            .is_escalated());
        assert!(!a
            .escalator()
            .signal(SignalKind::Pleasure, 0.2, "test")
            .unwrap()
            .is_escalated());
    }
}
