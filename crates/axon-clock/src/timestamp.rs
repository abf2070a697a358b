//! HLC timestamps.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A hybrid logical timestamp.
///
/// Field order matters: the derived `Ord` compares `physical_ms`, then
/// `logical`, then `node`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Wall-clock component in milliseconds since the Unix epoch.
    pub physical_ms: u64,
    /// Logical counter disambiguating stamps within one millisecond.
    pub logical: u32,
    /// Node that issued the stamp.
    pub node: NodeId,
}

impl Timestamp {
    pub fn new(physical_ms: u64, logical: u32, node: NodeId) -> Self {
        Self {
            physical_ms,
            logical,
            node,
        }
    }

    /// Compare only the clock components, ignoring the issuing node.
    pub fn clock_cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.physical_ms, self.logical).cmp(&(other.physical_ms, other.logical))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.physical_ms, self.logical, self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn physical_time_dominates() {
        let a = Timestamp::new(10, 99, node("z"));
        let b = Timestamp::new(11, 0, node("a"));
        assert!(a < b);
    }

    #[test]
    fn counter_then_node_break_ties() {
        let a = Timestamp::new(10, 1, node("z"));
        let b = Timestamp::new(10, 2, node("a"));
        assert!(a < b);

        let c = Timestamp::new(10, 2, node("b"));
        assert!(b < c);
        assert_eq!(b.clock_cmp(&c), std::cmp::Ordering::Equal);
    }

    #[test]
    fn display_is_compact() {
        let ts = Timestamp::new(1700, 3, node("n1"));
        assert_eq!(ts.to_string(), "1700.3@n1");
    }
}
