//! Health, metrics and per-round reports.

use std::collections::BTreeMap;
use std::time::Duration;

use axon_clock::{NodeId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::peer::{PeerState, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    /// Sync is off.
    Disabled,
    Healthy,
    /// Running, but with fewer live peers than required or a poor recent
    /// success ratio.
    Degraded,
    /// Running with no live peer at all.
    Critical,
}

/// Peers per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCounts {
    pub discovered: usize,
    pub health_checking: usize,
    pub syncing: usize,
    pub degraded: usize,
    pub unreachable: usize,
}

impl PeerCounts {
    pub(crate) fn count(&mut self, state: PeerState) {
        match state {
            PeerState::Discovered => self.discovered += 1,
            PeerState::HealthChecking => self.health_checking += 1,
            PeerState::Syncing => self.syncing += 1,
            PeerState::Degraded => self.degraded += 1,
            PeerState::Unreachable => self.unreachable += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.discovered + self.health_checking + self.syncing + self.degraded + self.unreachable
    }

    pub fn live(&self) -> usize {
        self.syncing + self.degraded
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub sync_enabled: bool,
    pub level: HealthLevel,
    pub peers: PeerCounts,
    /// Successful share of the most recent exchanges, 1.0 when none ran.
    pub success_ratio: f64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub rounds: u64,
    pub rounds_cancelled: u64,
    pub exchanges_ok: u64,
    pub exchanges_failed: u64,
    pub deltas_sent: u64,
    pub deltas_received: u64,
    /// Received deltas that changed local state.
    pub deltas_applied: u64,
    pub requests_served: u64,
    pub last_round_ms: Option<u64>,
    pub peer_latency_ms: BTreeMap<NodeId, u64>,
}

/// What happened with one peer during a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PeerOutcome {
    Synced {
        sent: usize,
        received: usize,
        applied: usize,
        latency_ms: u64,
    },
    Failed {
        reason: String,
    },
    /// Sync was disabled mid-round.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub round: u64,
    pub duration_ms: u64,
    pub peers: BTreeMap<NodeId, PeerOutcome>,
}

impl SyncSummary {
    pub fn succeeded(&self) -> usize {
        self.peers
            .values()
            .filter(|o| matches!(o, PeerOutcome::Synced { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.peers
            .values()
            .filter(|o| matches!(o, PeerOutcome::Failed { .. }))
            .count()
    }

    pub fn was_cancelled(&self) -> bool {
        self.peers.values().any(|o| matches!(o, PeerOutcome::Cancelled))
    }
}

/// Result of a diagnostic round trip.
///
/// Failures are reported here rather than as an error, with the time
/// spent before the exchange gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSyncReport {
    pub peer: NodeId,
    pub success: bool,
    pub latency: Duration,
    pub remote_hlc: Option<Timestamp>,
    pub error: Option<String>,
}

/// Payload of [`axon_bus::Topic::SyncLifecycle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Enabled,
    Disabled { cancelled_round: bool },
    SafetyCheckFailed { reason: String },
    RoundCompleted {
        round: u64,
        succeeded: usize,
        failed: usize,
        duration_ms: u64,
    },
    PeerStateChanged(Transition),
    PeerEvicted { peer: NodeId },
}
