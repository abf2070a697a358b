//! Sync monitor configuration.

use std::time::Duration;

/// Configuration for a [`SyncMonitor`](crate::SyncMonitor).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Live peers required before sync may be enabled.
    pub min_peers: usize,
    /// Largest tolerated lead of the HLC over wall time.
    pub max_clock_drift: Duration,
    pub sync_interval: Duration,
    pub heartbeat_interval: Duration,
    pub discovery_interval: Duration,
    /// Deadline for one exchange with one peer.
    pub exchange_timeout: Duration,
    /// Deadline for heartbeat and diagnostic pings.
    pub ping_timeout: Duration,
    /// Consecutive failures after which a peer is unreachable.
    pub unreachable_after_failures: u32,
    /// A peer not heard from for this long is unreachable.
    pub silence_window: Duration,
    /// A peer not heard from for this long is forgotten.
    pub eviction_window: Duration,
    /// Exchange outcomes kept for the success ratio.
    pub outcome_history: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_peers: 1,
            max_clock_drift: Duration::from_millis(500),
            sync_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(2),
            discovery_interval: Duration::from_secs(10),
            exchange_timeout: Duration::from_secs(2),
            ping_timeout: Duration::from_secs(1),
            unreachable_after_failures: 3,
            silence_window: Duration::from_secs(30),
            eviction_window: Duration::from_secs(300),
            outcome_history: 32,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn with_min_peers(mut self, min_peers: usize) -> Self {
        self.min_peers = min_peers;
        self
    }

    #[must_use]
    pub fn with_max_clock_drift(mut self, drift: Duration) -> Self {
        self.max_clock_drift = drift;
        self
    }

    #[must_use]
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    #[must_use]
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_unreachable_after_failures(mut self, failures: u32) -> Self {
        self.unreachable_after_failures = failures.max(1);
        self
    }

    #[must_use]
    pub fn with_silence_window(mut self, window: Duration) -> Self {
        self.silence_window = window;
        self
    }

    #[must_use]
    pub fn with_eviction_window(mut self, window: Duration) -> Self {
        self.eviction_window = window;
        self
    }
}
