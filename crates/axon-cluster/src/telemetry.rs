//! Connection liveness counters keyed by `(topic, node)`.
//!
//! The core only reads these through [`ConnectionTelemetry`]. Whoever
//! terminates connections owns the writes.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axon_clock::NodeId;
use serde::{Deserialize, Serialize};

/// Counters for one `(topic, node)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSample {
    pub topic: String,
    pub node: NodeId,
    /// Currently open connections.
    pub connections: u64,
    /// Messages seen since start.
    pub messages: u64,
}

/// Read-only source of connection samples.
pub trait ConnectionTelemetry: Send + Sync {
    fn samples(&self) -> Vec<ConnectionSample>;
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicU64,
    messages: AtomicU64,
}

type Key = (String, NodeId);
type Shard = RwLock<HashMap<Key, Arc<Counters>>>;

/// Sharded atomic counter map.
///
/// A key's counters are created once under its shard's write lock; every
/// update after that is a read lock plus an atomic add.
#[derive(Debug)]
pub struct ShardedConnectionCounters {
    shards: Vec<Shard>,
}

impl Default for ShardedConnectionCounters {
    fn default() -> Self {
        Self::new(16)
    }
}

impl ShardedConnectionCounters {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, topic: &str, node: &NodeId) -> &Shard {
        let mut hasher = DefaultHasher::new();
        topic.hash(&mut hasher);
        node.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    fn counters(&self, topic: &str, node: &NodeId) -> Arc<Counters> {
        let shard = self.shard(topic, node);
        let key = (topic.to_string(), node.clone());
        if let Some(c) = shard.read().unwrap_or_else(|p| p.into_inner()).get(&key) {
            return Arc::clone(c);
        }
        let mut map = shard.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(map.entry(key).or_default())
    }

    pub fn connect(&self, topic: &str, node: &NodeId) {
        self.counters(topic, node).connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn disconnect(&self, topic: &str, node: &NodeId) {
        let counters = self.counters(topic, node);
        let _ = counters
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_message(&self, topic: &str, node: &NodeId) {
        self.counters(topic, node).messages.fetch_add(1, Ordering::Relaxed);
    }
}

impl ConnectionTelemetry for ShardedConnectionCounters {
    fn samples(&self) -> Vec<ConnectionSample> {
        let mut samples: Vec<ConnectionSample> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(|p| p.into_inner())
                    .iter()
                    .map(|((topic, node), c)| ConnectionSample {
                        topic: topic.clone(),
                        node: node.clone(),
                        connections: c.connections.load(Ordering::Relaxed),
                        messages: c.messages.load(Ordering::Relaxed),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        samples.sort_by(|a, b| (&a.topic, &a.node).cmp(&(&b.topic, &b.node)));
        samples
    }
}

/// Cluster-wide aggregate of connection samples.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConnectionStats {
    pub total_connections: u64,
    pub total_messages: u64,
    pub connections_by_topic: BTreeMap<String, u64>,
    pub connections_by_node: BTreeMap<NodeId, u64>,
    /// Nodes with at least one open connection.
    pub live_nodes: usize,
    pub samples: Vec<ConnectionSample>,
}

impl ClusterConnectionStats {
    pub fn from_samples(samples: Vec<ConnectionSample>) -> Self {
        let mut stats = Self::default();
        let mut live = BTreeSet::new();
        for s in &samples {
            stats.total_connections += s.connections;
            stats.total_messages += s.messages;
            *stats.connections_by_topic.entry(s.topic.clone()).or_insert(0) += s.connections;
            *stats.connections_by_node.entry(s.node.clone()).or_insert(0) += s.connections;
            if s.connections > 0 {
                live.insert(s.node.clone());
            }
        }
        stats.live_nodes = live.len();
        stats.samples = samples;
        stats
    }
}
