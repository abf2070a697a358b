//! Grow-only counter with one slot per node.
//!
//! Slots carry absolute values and merge by max, so replaying an increment
//! delta is a no-op.

use std::collections::BTreeMap;

use axon_clock::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricCounter {
    slots: BTreeMap<NodeId, u64>,
}

impl MetricCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, node: &NodeId) -> u64 {
        self.slots.get(node).copied().unwrap_or(0)
    }

    /// Raise `node`'s slot to `value`. Lower values are ignored.
    pub fn raise(&mut self, node: &NodeId, value: u64) -> bool {
        let slot = self.slots.entry(node.clone()).or_insert(0);
        if value > *slot {
            *slot = value;
            true
        } else {
            false
        }
    }

    pub fn value(&self) -> u64 {
        self.slots.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    pub fn slots(&self) -> &BTreeMap<NodeId, u64> {
        &self.slots
    }

    pub fn merge(&mut self, other: &MetricCounter) -> bool {
        let mut changed = false;
        for (node, value) in &other.slots {
            changed |= self.raise(node, *value);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn slots_merge_by_max() {
        let mut a = MetricCounter::new();
        a.raise(&node("a"), 3);
        let mut b = MetricCounter::new();
        b.raise(&node("a"), 1);
        b.raise(&node("b"), 4);

        assert!(a.merge(&b));
        assert_eq!(a.value(), 7);
        assert!(!a.raise(&node("b"), 2));
        assert_eq!(a.slot(&node("b")), 4);
    }
}
