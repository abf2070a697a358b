//! Replicated objects and the deltas that move between nodes.
//!
//! A [`Delta`] is both the wire shape and the entry kept in an object's
//! log. Applying a delta is a join, so the same delta can arrive any number
//! of times, in any order, from any peer.

use std::collections::BTreeSet;
use std::fmt;

use axon_clock::{NodeId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{BeliefSet, ContextGraph, Edge, MetricCounter};

/// The kind of a replicated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrdtType {
    BeliefSet,
    ContextGraph,
    MetricCounter,
}

impl CrdtType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeliefSet => "belief_set",
            Self::ContextGraph => "context_graph",
            Self::MetricCounter => "metric_counter",
        }
    }
}

impl fmt::Display for CrdtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full state of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrdtObject {
    BeliefSet(BeliefSet),
    ContextGraph(ContextGraph),
    MetricCounter(MetricCounter),
}

impl CrdtObject {
    pub fn empty(crdt_type: CrdtType) -> Self {
        match crdt_type {
            CrdtType::BeliefSet => Self::BeliefSet(BeliefSet::new()),
            CrdtType::ContextGraph => Self::ContextGraph(ContextGraph::new()),
            CrdtType::MetricCounter => Self::MetricCounter(MetricCounter::new()),
        }
    }

    pub fn crdt_type(&self) -> CrdtType {
        match self {
            Self::BeliefSet(_) => CrdtType::BeliefSet,
            Self::ContextGraph(_) => CrdtType::ContextGraph,
            Self::MetricCounter(_) => CrdtType::MetricCounter,
        }
    }

    pub fn as_belief_set(&self) -> Option<&BeliefSet> {
        match self {
            Self::BeliefSet(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_context_graph(&self) -> Option<&ContextGraph> {
        match self {
            Self::ContextGraph(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_metric_counter(&self) -> Option<&MetricCounter> {
        match self {
            Self::MetricCounter(c) => Some(c),
            _ => None,
        }
    }

    /// Apply a replicated op. The caller has already matched types; a
    /// mismatch here means the op is malformed and leaves state untouched.
    pub(crate) fn apply(&mut self, op: &CrdtOp) -> std::result::Result<bool, String> {
        match (self, op) {
            (_, CrdtOp::Create) => Ok(false),
            (Self::BeliefSet(s), CrdtOp::AddBelief { belief, tag }) => Ok(s.add(belief, tag.clone())),
            (Self::BeliefSet(s), CrdtOp::RemoveBelief { tags, .. }) => Ok(s.remove(tags)),
            (Self::ContextGraph(g), CrdtOp::AddEdge { edge }) => {
                edge.check()?;
                Ok(g.add(edge.clone()))
            }
            (Self::MetricCounter(c), CrdtOp::CounterSlot { node, value }) => Ok(c.raise(node, *value)),
            (Self::BeliefSet(s), CrdtOp::State { snapshot: CrdtObject::BeliefSet(other) }) => Ok(s.merge(other)),
            (Self::ContextGraph(g), CrdtOp::State { snapshot: CrdtObject::ContextGraph(other) }) => {
                Ok(g.merge(other))
            }
            (Self::MetricCounter(c), CrdtOp::State { snapshot: CrdtObject::MetricCounter(other) }) => {
                Ok(c.merge(other))
            }
            (this, op) => Err(format!("{} op does not apply to a {}", op.name(), this.crdt_type())),
        }
    }

    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        match self {
            Self::BeliefSet(s) => s.check(),
            Self::ContextGraph(g) => g.check(),
            Self::MetricCounter(_) => Ok(()),
        }
    }
}

/// A replicated operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrdtOp {
    Create,
    AddBelief { belief: String, tag: Timestamp },
    RemoveBelief { belief: String, tags: BTreeSet<Timestamp> },
    AddEdge { edge: Edge },
    /// Absolute value of one node's counter slot.
    CounterSlot { node: NodeId, value: u64 },
    /// Full-state join, sent when a peer's cursor predates the log.
    State { snapshot: CrdtObject },
}

impl CrdtOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::AddBelief { .. } => "add_belief",
            Self::RemoveBelief { .. } => "remove_belief",
            Self::AddEdge { .. } => "add_edge",
            Self::CounterSlot { .. } => "counter_slot",
            Self::State { .. } => "state",
        }
    }

    /// The object type this op is defined for, if it is type-specific.
    pub fn target_type(&self) -> Option<CrdtType> {
        match self {
            Self::Create => None,
            Self::AddBelief { .. } | Self::RemoveBelief { .. } => Some(CrdtType::BeliefSet),
            Self::AddEdge { .. } => Some(CrdtType::ContextGraph),
            Self::CounterSlot { .. } => Some(CrdtType::MetricCounter),
            Self::State { snapshot } => Some(snapshot.crdt_type()),
        }
    }
}

/// An operation requested by a local caller, before stamping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOp {
    AddBelief(String),
    RemoveBelief(String),
    AddEdge(Edge),
    Increment(u64),
}

impl LocalOp {
    pub fn target_type(&self) -> CrdtType {
        match self {
            Self::AddBelief(_) | Self::RemoveBelief(_) => CrdtType::BeliefSet,
            Self::AddEdge(_) => CrdtType::ContextGraph,
            Self::Increment(_) => CrdtType::MetricCounter,
        }
    }
}

/// One replicated change to one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub object_type: CrdtType,
    pub object_id: String,
    pub op: CrdtOp,
    pub hlc: Timestamp,
    pub origin: NodeId,
}

impl Delta {
    /// BLAKE3 of the canonical JSON encoding, hex.
    pub fn content_id(&self) -> String {
        // Every map in a delta is a BTreeMap, so the JSON is canonical.
        match serde_json::to_vec(self) {
            Ok(bytes) => hex::encode(blake3::hash(&bytes).as_bytes()),
            Err(_) => String::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let delta: Delta = bincode::deserialize(bytes)?;
        if let Some(target) = delta.op.target_type() {
            if target != delta.object_type {
                return Err(Error::Codec(format!(
                    "{} op carried for a {}",
                    delta.op.name(),
                    delta.object_type
                )));
            }
        }
        Ok(delta)
    }
}

/// Deltas of one object past a version cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectBatch {
    pub object_id: String,
    pub object_type: CrdtType,
    /// Cursor the batch starts after.
    pub from_version: u64,
    /// Cursor to store once the batch is applied.
    pub to_version: u64,
    pub deltas: Vec<Delta>,
}

impl ObjectBatch {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::new(ms, 0, NodeId::new("a").unwrap())
    }

    fn add(belief: &str, ms: u64) -> Delta {
        Delta {
            object_type: CrdtType::BeliefSet,
            object_id: "agent1".into(),
            op: CrdtOp::AddBelief {
                belief: belief.into(),
                tag: ts(ms),
            },
            hlc: ts(ms),
            origin: NodeId::new("a").unwrap(),
        }
    }

    #[test]
    fn bincode_wire_shape() {
        let delta = add("x", 7);
        let bytes = delta.to_bytes().unwrap();
        assert_eq!(Delta::from_bytes(&bytes).unwrap(), delta);
        assert!(Delta::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn mismatched_op_is_rejected_on_decode() {
        let mut delta = add("x", 7);
        delta.object_type = CrdtType::MetricCounter;
        let bytes = delta.to_bytes().unwrap();
        assert!(matches!(Delta::from_bytes(&bytes), Err(Error::Codec(_))));
    }

    #[test]
    fn content_id_depends_on_content() {
        assert_eq!(add("x", 1).content_id(), add("x", 1).content_id());
        assert_ne!(add("x", 1).content_id(), add("y", 1).content_id());
        assert_eq!(add("x", 1).content_id().len(), 64);
    }

    #[test]
    fn state_op_joins_matching_type_only() {
        let mut graph = CrdtObject::empty(CrdtType::ContextGraph);
        let mut other = ContextGraph::new();
        other.add(Edge::new("a", "b", "c"));
        let op = CrdtOp::State {
            snapshot: CrdtObject::ContextGraph(other),
        };
        assert_eq!(graph.apply(&op), Ok(true));
        assert_eq!(graph.apply(&op), Ok(false));

        let mut counter = CrdtObject::empty(CrdtType::MetricCounter);
        assert!(counter.apply(&op).is_err());
        assert_eq!(counter, CrdtObject::empty(CrdtType::MetricCounter));
    }
}
