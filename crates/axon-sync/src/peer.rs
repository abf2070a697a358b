//! Peer bookkeeping and the per-peer state machine.
//!
//! ```text
//! Discovered ──► HealthChecking ──► Syncing
//!                     ▲   │            │ failure
//!                     │   ▼            ▼
//!                     ├── Degraded ◄───┘
//!                     │   │ too many failures / silence
//!                     │   ▼
//!                     └── Unreachable ──► evicted
//! ```

use std::fmt;
use std::time::Duration;

use axon_clock::NodeId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Where a peer was found.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub address: String,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Discovered,
    HealthChecking,
    Syncing,
    Degraded,
    Unreachable,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discovered => "discovered",
            Self::HealthChecking => "health_checking",
            Self::Syncing => "syncing",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}

/// A state change of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub peer: NodeId,
    pub from: PeerState,
    pub to: PeerState,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub node_id: NodeId,
    pub address: String,
    pub state: PeerState,
    pub discovered_at: Instant,
    /// Last successful ping or exchange.
    pub last_seen: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_latency: Option<Duration>,
    pub last_error: Option<String>,
}

impl Peer {
    pub(crate) fn new(info: PeerInfo, now: Instant) -> Self {
        Self {
            node_id: info.node_id,
            address: info.address,
            state: PeerState::Discovered,
            discovered_at: now,
            last_seen: None,
            consecutive_failures: 0,
            last_latency: None,
            last_error: None,
        }
    }

    /// Answering recently enough to serve reads.
    pub fn is_live(&self) -> bool {
        matches!(self.state, PeerState::Syncing | PeerState::Degraded)
    }

    /// Worth attempting an exchange with.
    pub fn is_eligible(&self) -> bool {
        self.state != PeerState::Unreachable
    }

    /// Time since the peer last answered (or was discovered).
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen.unwrap_or(self.discovered_at))
    }

    fn move_to(&mut self, to: PeerState) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = std::mem::replace(&mut self.state, to);
        Some(Transition {
            peer: self.node_id.clone(),
            from,
            to,
        })
    }

    /// A check is about to run; anything but a healthy peer is checked again.
    pub(crate) fn begin_check(&mut self) -> Option<Transition> {
        match self.state {
            PeerState::Discovered | PeerState::Degraded | PeerState::Unreachable => {
                self.move_to(PeerState::HealthChecking)
            }
            PeerState::HealthChecking | PeerState::Syncing => None,
        }
    }

    pub(crate) fn record_success(&mut self, now: Instant, latency: Duration) -> Option<Transition> {
        self.last_seen = Some(now);
        self.consecutive_failures = 0;
        self.last_latency = Some(latency);
        self.last_error = None;
        self.move_to(PeerState::Syncing)
    }

    pub(crate) fn record_failure(&mut self, reason: String, unreachable_after: u32) -> Option<Transition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(reason);
        if self.consecutive_failures >= unreachable_after {
            self.move_to(PeerState::Unreachable)
        } else {
            self.move_to(PeerState::Degraded)
        }
    }

    pub(crate) fn mark_unreachable(&mut self) -> Option<Transition> {
        self.move_to(PeerState::Unreachable)
    }
}
