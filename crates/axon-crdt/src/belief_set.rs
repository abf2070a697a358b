//! Observed-remove set of beliefs.
//!
//! Every add carries a unique tag (the HLC timestamp of the add). A remove
//! tombstones exactly the tags it observed, so an add that the remover
//! never saw survives the remove. A belief is present iff at least one of
//! its tags is not tombstoned.

use std::collections::{BTreeMap, BTreeSet};

use axon_clock::Timestamp;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeliefSet {
    adds: BTreeMap<String, BTreeSet<Timestamp>>,
    tombstones: BTreeSet<Timestamp>,
}

impl BeliefSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an add of `belief` under `tag`. Returns whether state changed.
    pub fn add(&mut self, belief: &str, tag: Timestamp) -> bool {
        self.adds.entry(belief.to_string()).or_default().insert(tag)
    }

    /// Tombstone `tags`. Returns whether state changed.
    ///
    /// Tags are tombstoned even when their add has not arrived yet; the add
    /// then lands already removed.
    pub fn remove(&mut self, tags: &BTreeSet<Timestamp>) -> bool {
        let before = self.tombstones.len();
        self.tombstones.extend(tags.iter().cloned());
        self.tombstones.len() != before
    }

    /// Tags of `belief` that are currently live.
    pub fn live_tags(&self, belief: &str) -> BTreeSet<Timestamp> {
        self.adds
            .get(belief)
            .map(|tags| tags.difference(&self.tombstones).cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, belief: &str) -> bool {
        self.adds
            .get(belief)
            .is_some_and(|tags| tags.iter().any(|t| !self.tombstones.contains(t)))
    }

    /// Present beliefs, in lexical order.
    pub fn beliefs(&self) -> BTreeSet<String> {
        self.adds
            .iter()
            .filter(|(_, tags)| tags.iter().any(|t| !self.tombstones.contains(t)))
            .map(|(belief, _)| belief.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.beliefs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Join with another replica. Returns whether state changed.
    pub fn merge(&mut self, other: &BeliefSet) -> bool {
        let mut changed = false;
        for (belief, tags) in &other.adds {
            let ours = self.adds.entry(belief.clone()).or_default();
            for tag in tags {
                changed |= ours.insert(tag.clone());
            }
        }
        changed |= self.remove(&other.tombstones);
        changed
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        if let Some((belief, _)) = self.adds.iter().find(|(_, tags)| tags.is_empty()) {
            return Err(format!("belief {belief:?} has no add tags"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_clock::NodeId;

    fn tag(ms: u64, node: &str) -> Timestamp {
        Timestamp::new(ms, 0, NodeId::new(node).unwrap())
    }

    #[test]
    fn remove_only_hides_observed_adds() {
        let mut a = BeliefSet::new();
        a.add("x", tag(1, "a"));

        let mut b = a.clone();
        b.add("x", tag(2, "b"));

        let observed = a.live_tags("x");
        assert!(a.remove(&observed));
        assert!(!a.contains("x"));

        a.merge(&b);
        assert!(a.contains("x"), "concurrent add must win");
        assert_eq!(a.live_tags("x"), BTreeSet::from([tag(2, "b")]));
    }

    #[test]
    fn tombstone_before_add_keeps_belief_hidden() {
        let mut s = BeliefSet::new();
        assert!(s.remove(&BTreeSet::from([tag(5, "a")])));
        assert!(s.add("y", tag(5, "a")));
        assert!(!s.contains("y"));
        assert!(s.is_empty());
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = BeliefSet::new();
        a.add("x", tag(1, "a"));
        a.add("y", tag(2, "a"));
        let copy = a.clone();
        assert!(!a.merge(&copy));
        assert_eq!(a, copy);
        assert_eq!(
            a.beliefs(),
            BTreeSet::from(["x".to_string(), "y".to_string()])
        );
    }
}
