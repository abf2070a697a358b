//! Known topics plus a validated custom escape hatch.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Maximum length of a custom topic name.
pub const MAX_CUSTOM_TOPIC_LEN: usize = 128;

/// Viable-system subsystems that publish their own pattern streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subsystem {
    /// Operations
    S1,
    /// Coordination
    S2,
    /// Control
    S3,
    /// Intelligence
    S4,
    /// Policy
    S5,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [Self::S1, Self::S2, Self::S3, Self::S4, Self::S5];

    fn patterns_topic(self) -> &'static str {
        match self {
            Self::S1 => "vsm_s1_patterns",
            Self::S2 => "vsm_s2_patterns",
            Self::S3 => "vsm_s3_patterns",
            Self::S4 => "vsm_s4_patterns",
            Self::S5 => "vsm_s5_patterns",
        }
    }
}

/// A bus topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    /// A CRDT object changed locally or through a merge.
    StateChanged,
    /// Peer sync lifecycle (enabled, disabled, rounds, peer transitions).
    SyncLifecycle,
    /// Pain/pleasure signals.
    Algedonic,
    /// A node's search collaborator matched a pattern.
    PatternMatched,
    /// The aggregator accepted a pattern report.
    PatternIndexed,
    /// A pattern crossed the cluster consensus quorum.
    ConsensusReached,
    /// Per-subsystem pattern stream.
    SubsystemPatterns(Subsystem),
    /// Application-defined topic, validated at subscribe time.
    Custom(String),
}

impl Topic {
    /// Wire name of the topic.
    pub fn as_str(&self) -> &str {
        match self {
            Self::StateChanged => "state_changed",
            Self::SyncLifecycle => "sync_lifecycle",
            Self::Algedonic => "algedonic",
            Self::PatternMatched => "pattern_matched",
            Self::PatternIndexed => "pattern_indexed",
            Self::ConsensusReached => "consensus_reached",
            Self::SubsystemPatterns(s) => s.patterns_topic(),
            Self::Custom(name) => name,
        }
    }

    /// Resolve a wire name: known names map to their variant, anything else
    /// becomes a validated [`Topic::Custom`].
    pub fn parse(name: &str) -> Result<Self> {
        if let Some(known) = Self::known(name) {
            return Ok(known);
        }
        let topic = Self::Custom(name.to_string());
        topic.validate()?;
        Ok(topic)
    }

    /// Build a custom topic, rejecting names that shadow a known topic.
    pub fn custom(name: impl Into<String>) -> Result<Self> {
        let topic = Self::Custom(name.into());
        topic.validate()?;
        Ok(topic)
    }

    /// Check a topic is acceptable for subscription.
    pub fn validate(&self) -> Result<()> {
        let Self::Custom(name) = self else {
            return Ok(());
        };
        let invalid = |reason| Error::InvalidTopic {
            name: name.clone(),
            reason,
        };
        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if name.len() > MAX_CUSTOM_TOPIC_LEN {
            return Err(invalid("name longer than 128 characters"));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b':' | b'-'))
        {
            return Err(invalid("only [a-z0-9_.:-] allowed"));
        }
        if Self::known(name).is_some() {
            return Err(invalid("shadows a built-in topic"));
        }
        Ok(())
    }

    /// Whether this topic is one of the built-in variants.
    pub fn is_builtin(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }

    fn known(name: &str) -> Option<Self> {
        let topic = match name {
            "state_changed" => Self::StateChanged,
            "sync_lifecycle" => Self::SyncLifecycle,
            "algedonic" => Self::Algedonic,
            "pattern_matched" => Self::PatternMatched,
            "pattern_indexed" => Self::PatternIndexed,
            "consensus_reached" => Self::ConsensusReached,
            other => {
                return Subsystem::ALL
                    .into_iter()
                    .find(|s| s.patterns_topic() == other)
                    .map(Self::SubsystemPatterns)
            }
        };
        Some(topic)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Topic {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_round_trip() {
        for topic in [
            Topic::StateChanged,
            Topic::SyncLifecycle,
            Topic::Algedonic,
            Topic::PatternMatched,
            Topic::PatternIndexed,
            Topic::ConsensusReached,
            Topic::SubsystemPatterns(Subsystem::S4),
        ] {
            assert_eq!(Topic::parse(topic.as_str()).unwrap(), topic);
        }
    }

    #[test]
    fn subsystem_topics_have_distinct_names() {
        assert_eq!(Topic::SubsystemPatterns(Subsystem::S1).as_str(), "vsm_s1_patterns");
        assert_eq!(
            Topic::parse("vsm_s5_patterns").unwrap(),
            Topic::SubsystemPatterns(Subsystem::S5)
        );
    }

    #[test]
    fn custom_topics_are_validated() {
        assert!(Topic::custom("ops.alerts:eu-1").is_ok());
        assert!(Topic::custom("").is_err());
        assert!(Topic::custom("Has Spaces").is_err());
        assert!(Topic::custom("x".repeat(129)).is_err());
        assert!(Topic::custom("algedonic").is_err());
        assert!(Topic::Custom("BAD".into()).validate().is_err());
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&Topic::SubsystemPatterns(Subsystem::S2)).unwrap();
        assert_eq!(json, "\"vsm_s2_patterns\"");
        let back: Topic = serde_json::from_str("\"metrics.cpu\"").unwrap();
        assert_eq!(back, Topic::Custom("metrics.cpu".into()));
        assert!(serde_json::from_str::<Topic>("\"NOPE\"").is_err());
    }
}
