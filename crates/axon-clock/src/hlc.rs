//! The hybrid logical clock itself.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{NodeId, PhysicalClock, SystemClock, Timestamp};

#[derive(Debug, Clone, Copy, Default)]
struct ClockState {
    physical_ms: u64,
    logical: u32,
}

impl ClockState {
    /// Bump the logical counter, spilling into the next millisecond when the
    /// counter is exhausted so monotonicity survives pathological bursts.
    fn bump(&mut self, base: u32) {
        match base.checked_add(1) {
            Some(next) => self.logical = next,
            None => {
                self.physical_ms += 1;
                self.logical = 0;
            }
        }
    }
}

/// Hybrid Logical Clock.
///
/// Shared by every component of a node (`Arc<Hlc>`). Each call to
/// [`now`](Self::now) or [`update`](Self::update) returns a stamp strictly
/// greater than everything previously returned or merged on this node.
#[derive(Debug)]
pub struct Hlc {
    node: NodeId,
    source: Arc<dyn PhysicalClock>,
    state: Mutex<ClockState>,
}

impl Hlc {
    /// Create a clock backed by the system wall clock.
    pub fn new(node: NodeId) -> Self {
        Self::with_source(node, Arc::new(SystemClock))
    }

    /// Create a clock backed by an arbitrary physical time source.
    pub fn with_source(node: NodeId, source: Arc<dyn PhysicalClock>) -> Self {
        Self {
            node,
            source,
            state: Mutex::new(ClockState::default()),
        }
    }

    /// The node this clock stamps for.
    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    /// Issue a new local timestamp.
    pub fn now(&self) -> Timestamp {
        let pt = self.source.now_ms();
        let mut state = self.lock();
        if pt > state.physical_ms {
            state.physical_ms = pt;
            state.logical = 0;
        } else {
            let base = state.logical;
            state.bump(base);
        }
        self.stamp(&state)
    }

    /// Merge a remote timestamp and issue a stamp that dominates it.
    pub fn update(&self, remote: &Timestamp) -> Timestamp {
        let pt = self.source.now_ms();
        let mut state = self.lock();
        let local_ms = state.physical_ms;
        let next_ms = local_ms.max(remote.physical_ms).max(pt);

        if next_ms == local_ms && next_ms == remote.physical_ms {
            let base = state.logical.max(remote.logical);
            state.bump(base);
        } else if next_ms == local_ms {
            let base = state.logical;
            state.bump(base);
        } else if next_ms == remote.physical_ms {
            state.physical_ms = next_ms;
            state.bump(remote.logical);
        } else {
            state.physical_ms = next_ms;
            state.logical = 0;
        }
        self.stamp(&state)
    }

    /// The most recently issued timestamp, without advancing the clock.
    pub fn peek(&self) -> Timestamp {
        let state = self.lock();
        self.stamp(&state)
    }

    /// How far the logical clock runs ahead of wall time, in milliseconds.
    ///
    /// Large values mean a peer with a fast clock has dragged this node
    /// forward.
    pub fn drift_ms(&self) -> u64 {
        let pt = self.source.now_ms();
        self.lock().physical_ms.saturating_sub(pt)
    }

    fn stamp(&self, state: &ClockState) -> Timestamp {
        Timestamp::new(state.physical_ms, state.logical, self.node.clone())
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        // The state is two integers; a panic while holding the lock cannot
        // leave it half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
