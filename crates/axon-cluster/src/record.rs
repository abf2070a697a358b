//! Pattern records and the payloads the aggregator exchanges on the bus.

use std::collections::BTreeSet;

use axon_clock::{NodeId, Timestamp};
use serde::{Deserialize, Serialize};

/// Every node that has reported one pattern.
///
/// Records only grow: nodes are added, never removed, so a record that
/// reaches a quorum stays there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPatternRecord {
    pub pattern_id: String,
    pub reporting_nodes: BTreeSet<NodeId>,
    pub first_seen: Timestamp,
    /// First vector any report carried.
    pub vector: Option<Vec<f32>>,
}

impl ClusterPatternRecord {
    pub(crate) fn new(pattern_id: impl Into<String>, first_seen: Timestamp) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            reporting_nodes: BTreeSet::new(),
            first_seen,
            vector: None,
        }
    }

    pub fn node_count(&self) -> usize {
        self.reporting_nodes.len()
    }

    pub fn is_consensus(&self, min_nodes: usize) -> bool {
        self.reporting_nodes.len() >= min_nodes
    }
}

/// Payload of [`axon_bus::Topic::PatternMatched`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub node_id: NodeId,
    pub pattern_id: String,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
}

/// Payload of [`axon_bus::Topic::PatternIndexed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternIndexed {
    pub pattern_id: String,
    pub node: NodeId,
    /// Distinct reporting nodes after this report.
    pub count: usize,
    /// The node had already reported this pattern.
    pub deduplicated: bool,
}

/// Payload of [`axon_bus::Topic::ConsensusReached`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusReached {
    pub pattern_id: String,
    pub nodes: BTreeSet<NodeId>,
    pub quorum: usize,
}

/// What [`ClusterAggregator::report_match`](crate::ClusterAggregator::report_match) did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub pattern_id: String,
    pub count: usize,
    pub deduplicated: bool,
    /// This report pushed the pattern over the quorum.
    pub consensus_reached: bool,
}

/// Replicated pattern counters, summed over every node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMetrics {
    pub indexed: u64,
    pub deduplicated: u64,
}
