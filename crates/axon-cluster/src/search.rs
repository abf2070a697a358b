//! Vector search seam and an in-process backend.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use axon_clock::NodeId;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Names one index on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexRef {
    pub node: NodeId,
    pub index: String,
}

impl IndexRef {
    pub fn new(node: NodeId, index: impl Into<String>) -> Self {
        Self {
            node,
            index: index.into(),
        }
    }
}

/// One result from a backend; smaller distance is closer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub distance: f32,
}

/// External vector-similarity collaborator.
pub trait SearchBackend: Send + Sync {
    fn search<'a>(&'a self, index: &'a IndexRef, vector: &'a [f32], k: usize) -> BoxFuture<'a, Result<Vec<SearchHit>>>;
}

#[derive(Debug, Default)]
struct NodeIndex {
    vectors: BTreeMap<String, Vec<f32>>,
    failing: bool,
    latency: Duration,
}

/// Brute-force Euclidean search over per-node in-memory indexes.
///
/// Nodes can be made to fail or to answer slowly, which is how the demo
/// binary and the tests exercise partial availability.
#[derive(Debug, Default)]
pub struct MemorySearch {
    nodes: Mutex<BTreeMap<NodeId, NodeIndex>>,
}

impl MemorySearch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<NodeId, NodeIndex>> {
        self.nodes.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert(&self, node: &NodeId, id: impl Into<String>, vector: Vec<f32>) {
        self.lock()
            .entry(node.clone())
            .or_default()
            .vectors
            .insert(id.into(), vector);
    }

    pub fn set_failing(&self, node: &NodeId, failing: bool) {
        self.lock().entry(node.clone()).or_default().failing = failing;
    }

    pub fn set_latency(&self, node: &NodeId, latency: Duration) {
        self.lock().entry(node.clone()).or_default().latency = latency;
    }

    fn query(&self, node: &NodeId, vector: &[f32], k: usize) -> Result<(Vec<SearchHit>, Duration)> {
        let nodes = self.lock();
        let Some(index) = nodes.get(node) else {
            return Ok((Vec::new(), Duration::ZERO));
        };
        if index.failing {
            return Err(Error::Search(format!("index on {node} is unavailable")));
        }
        let mut hits: Vec<SearchHit> = index
            .vectors
            .iter()
            .filter(|(_, v)| v.len() == vector.len())
            .map(|(id, v)| SearchHit {
                id: id.clone(),
                distance: euclidean(v, vector),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok((hits, index.latency))
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

impl SearchBackend for MemorySearch {
    fn search<'a>(&'a self, index: &'a IndexRef, vector: &'a [f32], k: usize) -> BoxFuture<'a, Result<Vec<SearchHit>>> {
        Box::pin(async move {
            let (hits, latency) = self.query(&index.node, vector, k)?;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Ok(hits)
        })
    }
}
