//! Immutable, HLC-stamped events.

use axon_clock::{NodeId, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Topic;

/// Content-derived event identifier (first 16 bytes of a BLAKE3 hash, hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Derive the id from the fields that make an event unique.
    pub fn derive(source: &NodeId, hlc: &Timestamp, topic: &Topic) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(source.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(&hlc.physical_ms.to_be_bytes());
        hasher.update(&hlc.logical.to_be_bytes());
        hasher.update(hlc.node.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(topic.as_str().as_bytes());
        let hash = hasher.finalize();
        Self(hex::encode(&hash.as_bytes()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0[..8.min(self.0.len())])
    }
}

/// Delivery lane an event travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Normal bounded lane; may be dropped under backpressure.
    Ordinary,
    /// Escalated lane; drained first, never dropped.
    Algedonic,
}

/// A published event. Shared as `Arc<Event>` and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub hlc: Timestamp,
    pub source_node: NodeId,
    pub priority: Priority,
}

impl Event {
    pub fn new(topic: Topic, payload: serde_json::Value, hlc: Timestamp, priority: Priority) -> Self {
        let source_node = hlc.node.clone();
        Self {
            id: EventId::derive(&source_node, &hlc, &topic),
            topic,
            payload,
            hlc,
            source_node,
            priority,
        }
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }

    pub fn is_algedonic(&self) -> bool {
        self.priority == Priority::Algedonic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(ms: u64, node: &str) -> Timestamp {
        Timestamp::new(ms, 0, NodeId::new(node).unwrap())
    }

    #[test]
    fn ids_are_deterministic_and_distinct() {
        let a = Event::new(Topic::StateChanged, json!({}), ts(1, "n1"), Priority::Ordinary);
        let b = Event::new(Topic::StateChanged, json!({"x": 1}), ts(1, "n1"), Priority::Ordinary);
        let c = Event::new(Topic::StateChanged, json!({}), ts(2, "n1"), Priority::Ordinary);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.id.as_str().len(), 32);
    }

    #[test]
    fn payload_decodes() {
        #[derive(Deserialize)]
        struct Body {
            object_id: String,
        }
        let event = Event::new(
            Topic::StateChanged,
            json!({"object_id": "agent1"}),
            ts(5, "n1"),
            Priority::Ordinary,
        );
        let body: Body = event.payload_as().unwrap();
        assert_eq!(body.object_id, "agent1");
        assert_eq!(event.source_node.as_str(), "n1");
    }
}
