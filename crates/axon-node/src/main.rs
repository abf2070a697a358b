//! Axon Node binary
//!
//! Runs a small in-process cluster built from the environment config and
//! walks it through belief replication, pattern consensus and an
//! algedonic escalation.

use std::sync::Arc;
use std::time::Duration;

use axon_bus::SignalKind;
use axon_clock::NodeId;
use axon_cluster::{MemorySearch, ShardedConnectionCounters};
use axon_node::{Node, NodeConfig};
use axon_sync::MemoryNetwork;
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEMO_PEERS: usize = 2;
const VECTOR_DIM: usize = 8;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "axon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::from_env()?;
    tracing::info!(node = %config.node_id, "Starting Axon node");

    let network = MemoryNetwork::new();
    let search = Arc::new(MemorySearch::new());
    let telemetry = Arc::new(ShardedConnectionCounters::default());

    let mut configs = vec![config.clone()];
    for i in 1..=DEMO_PEERS {
        let mut peer = config.clone();
        peer.node_id = NodeId::new(format!("{}-peer-{}", config.node_id, i))?;
        configs.push(peer);
    }

    let mut nodes = Vec::new();
    for config in configs {
        let node = Node::join_memory(&network, config, search.clone(), telemetry.clone()).await?;
        telemetry.connect("algedonic", node.node_id());
        nodes.push(node);
    }

    for node in &nodes {
        node.monitor().discover_peers().await?;
    }
    for node in &nodes {
        node.monitor().heartbeat().await;
        if let Err(e) = node.monitor().enable_sync().await {
            tracing::warn!(node = %node.node_id(), "sync stays disabled: {}", e);
        }
    }
    for node in nodes.iter_mut() {
        node.spawn_background()?;
    }

    // Each node contributes a belief to the shared set.
    for (i, node) in nodes.iter().enumerate() {
        node.store().create_belief_set("agent1").await?;
        node.store().add_belief("agent1", format!("belief-{i}")).await?;
    }

    // Every node indexes a random vector for one shared pattern and reports it.
    let mut rng = rand::thread_rng();
    let query: Vec<f32> = (0..VECTOR_DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
    for node in &nodes {
        let vector: Vec<f32> = query.iter().map(|x| x + rng.gen_range(-0.1..0.1)).collect();
        search.insert(node.node_id(), "pattern-alpha", vector.clone());
        node.aggregator()
            .report_match(node.node_id(), "pattern-alpha", Some(vector))
            .await?;
    }

    for node in &nodes {
        match node.monitor().sync_with_peers().await {
            Ok(summary) => tracing::info!(
                node = %node.node_id(),
                succeeded = summary.succeeded(),
                failed = summary.failed(),
                "sync round finished"
            ),
            Err(e) => tracing::warn!(node = %node.node_id(), "sync round skipped: {}", e),
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    for node in &nodes {
        node.aggregator().refresh_from_store().await?;
        let beliefs = node.store().beliefs("agent1").await?;
        let agreed = node.aggregator().get_consensus_patterns(nodes.len());
        let metrics = node.aggregator().pattern_metrics().await?;
        tracing::info!(
            node = %node.node_id(),
            beliefs = ?beliefs,
            consensus = agreed.len(),
            indexed = metrics.indexed,
            "node state"
        );
    }

    let lead = &nodes[0];
    let result = lead.aggregator().search_cluster(&query, 3).await;
    for hit in &result.hits {
        tracing::info!(pattern = %hit.pattern_id, score = hit.score, node = %hit.node, "cluster search hit");
    }
    let stats = lead.aggregator().get_cluster_connection_stats();
    tracing::info!(connections = stats.total_connections, live_nodes = stats.live_nodes, "connection stats");

    lead.escalator().signal(SignalKind::Pain, 0.95, "demo")?;
    tracing::info!(health = ?lead.monitor().health_status().level, "sync health");

    for node in nodes {
        node.shutdown().await?;
    }
    Ok(())
}
