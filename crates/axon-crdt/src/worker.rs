//! Per-object worker tasks and their supervisor.
//!
//! Each object is owned by exactly one task. Callers talk to it over an
//! mpsc mailbox, so operations on one object serialize while different
//! objects proceed in parallel.
//!
//! The supervisor keeps a checkpoint of the object plus a journal of every
//! delta committed since. When the worker panics the state is rebuilt from
//! checkpoint and journal and the same mailbox keeps draining. Only the
//! command that panicked is lost.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axon_bus::{EventBus, Topic};
use axon_clock::{NodeId, Timestamp};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::delta::{CrdtObject, CrdtOp, CrdtType, Delta, LocalOp, ObjectBatch};
use crate::error::{Error, Result};

/// How often a crashed worker may be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed within `window` before the worker is abandoned.
    pub max_restarts: u32,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// Never restart.
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            window: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Tuning for the store and its workers.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Commands buffered per worker before senders wait.
    pub mailbox_capacity: usize,
    /// Deltas kept per object; older entries are compacted away.
    pub max_log_len: usize,
    /// Committed deltas between supervisor checkpoints.
    pub checkpoint_every: usize,
    /// How long `verify` waits on each worker.
    pub verify_timeout: Duration,
    pub restart: RestartPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            max_log_len: 1024,
            checkpoint_every: 32,
            verify_timeout: Duration::from_secs(1),
            restart: RestartPolicy::default(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_max_log_len(mut self, len: usize) -> Self {
        self.max_log_len = len.max(1);
        self
    }

    #[must_use]
    pub fn with_checkpoint_every(mut self, every: usize) -> Self {
        self.checkpoint_every = every.max(1);
        self
    }

    #[must_use]
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

/// Read-only view of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub object_id: String,
    pub object: CrdtObject,
    /// Number of deltas committed on this node.
    pub version: u64,
    /// Timestamp of the last committed delta.
    pub updated: Option<Timestamp>,
}

/// Payload of [`Topic::StateChanged`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub object_id: String,
    pub object_type: CrdtType,
    pub op: String,
    pub version: u64,
    pub hlc: Timestamp,
    pub origin: NodeId,
}

pub(crate) fn publish_state_change(bus: &EventBus, delta: &Delta, version: u64) {
    let change = StateChange {
        object_id: delta.object_id.clone(),
        object_type: delta.object_type,
        op: delta.op.name().to_string(),
        version,
        hlc: delta.hlc.clone(),
        origin: delta.origin.clone(),
    };
    if let Err(e) = bus.publish_json(Topic::StateChanged, &change) {
        warn!(object = %delta.object_id, error = %e, "failed to publish state change");
    }
}

/// Counters shared by every worker of one store.
#[derive(Debug, Default)]
pub(crate) struct StoreCounters {
    pub local_ops: AtomicU64,
    pub merges_applied: AtomicU64,
    pub merges_duplicate: AtomicU64,
    pub type_conflicts: AtomicU64,
    pub restarts: AtomicU64,
}

/// State owned by a worker.
#[derive(Debug, Clone)]
pub(crate) struct ObjectState {
    id: String,
    object: CrdtObject,
    log: VecDeque<Delta>,
    /// Version of the entry just before `log[0]`.
    log_base: u64,
    version: u64,
    updated: Option<Timestamp>,
}

impl ObjectState {
    pub(crate) fn new(id: String, crdt_type: CrdtType) -> Self {
        Self {
            id,
            object: CrdtObject::empty(crdt_type),
            log: VecDeque::new(),
            log_base: 0,
            version: 0,
            updated: None,
        }
    }

    pub(crate) fn append(&mut self, delta: Delta, max_log_len: usize) {
        self.updated = Some(delta.hlc.clone());
        self.log.push_back(delta);
        self.version += 1;
        while self.log.len() > max_log_len {
            self.log.pop_front();
            self.log_base += 1;
        }
    }

    fn snapshot(&self) -> ObjectSnapshot {
        ObjectSnapshot {
            object_id: self.id.clone(),
            object: self.object.clone(),
            version: self.version,
            updated: self.updated.clone(),
        }
    }

    fn check(&self) -> std::result::Result<(), String> {
        self.object.check()?;
        if self.log_base + self.log.len() as u64 != self.version {
            return Err(format!(
                "log covers {}..{} but version is {}",
                self.log_base,
                self.log_base + self.log.len() as u64,
                self.version
            ));
        }
        if let Some(stray) = self.log.iter().find(|d| d.object_id != self.id) {
            return Err(format!("log holds a delta for {:?}", stray.object_id));
        }
        Ok(())
    }
}

pub(crate) enum Command {
    Apply {
        op: LocalOp,
        reply: oneshot::Sender<Result<Delta>>,
    },
    Merge {
        delta: Delta,
        reply: oneshot::Sender<Result<bool>>,
    },
    Snapshot {
        reply: oneshot::Sender<ObjectSnapshot>,
    },
    DeltasSince {
        version: u64,
        reply: oneshot::Sender<ObjectBatch>,
    },
    Verify {
        reply: oneshot::Sender<std::result::Result<(), String>>,
    },
    #[cfg(test)]
    Crash,
}

#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub bus: EventBus,
    pub config: StoreConfig,
    pub counters: Arc<StoreCounters>,
    /// Mirrors `ObjectState::version` for lock-free reads by the store.
    pub version: Arc<AtomicU64>,
}

pub(crate) fn spawn(state: ObjectState, ctx: WorkerContext) -> mpsc::Sender<Command> {
    let (tx, rx) = mpsc::channel(ctx.config.mailbox_capacity);
    ctx.version.store(state.version, Ordering::Release);
    tokio::spawn(supervise(state, rx, ctx));
    tx
}

struct Worker {
    state: ObjectState,
    checkpoint: ObjectState,
    journal: Vec<Delta>,
    ctx: WorkerContext,
}

async fn supervise(state: ObjectState, mut rx: mpsc::Receiver<Command>, ctx: WorkerContext) {
    let policy = ctx.config.restart;
    let mut worker = Worker {
        checkpoint: state.clone(),
        state,
        journal: Vec::new(),
        ctx,
    };
    let mut crashes: VecDeque<Instant> = VecDeque::new();

    loop {
        let outcome = AssertUnwindSafe(worker.serve(&mut rx)).catch_unwind().await;
        let panic = match outcome {
            Ok(()) => {
                debug!(object = %worker.state.id, "mailbox closed, worker exiting");
                return;
            }
            Err(panic) => panic,
        };

        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(object = %worker.state.id, %reason, "CRDT worker crashed");

        let now = Instant::now();
        while crashes
            .front()
            .is_some_and(|t| now.duration_since(*t) > policy.window)
        {
            crashes.pop_front();
        }
        if crashes.len() >= policy.max_restarts as usize {
            error!(
                object = %worker.state.id,
                restarts = crashes.len(),
                "restart budget exhausted, abandoning worker"
            );
            return;
        }
        crashes.push_back(now);

        worker.restore();
        worker.ctx.counters.restarts.fetch_add(1, Ordering::Relaxed);
        info!(
            object = %worker.state.id,
            version = worker.state.version,
            "CRDT worker restarted from checkpoint"
        );
    }
}

impl Worker {
    async fn serve(&mut self, rx: &mut mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Apply { op, reply } => {
                let _ = reply.send(self.apply_local(op));
            }
            Command::Merge { delta, reply } => {
                let _ = reply.send(self.merge(delta));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
            Command::DeltasSince { version, reply } => {
                let _ = reply.send(self.deltas_since(version));
            }
            Command::Verify { reply } => {
                let _ = reply.send(self.state.check());
            }
            #[cfg(test)]
            Command::Crash => panic!("injected crash"),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidOp {
            id: self.state.id.clone(),
            reason: reason.into(),
        }
    }

    fn conflict(&self, requested: CrdtType) -> Error {
        self.ctx.counters.type_conflicts.fetch_add(1, Ordering::Relaxed);
        let existing = self.state.object.crdt_type();
        warn!(object = %self.state.id, %existing, %requested, "type conflict");
        Error::TypeConflict {
            id: self.state.id.clone(),
            existing,
            requested,
        }
    }

    fn apply_local(&mut self, op: LocalOp) -> Result<Delta> {
        let crdt_type = self.state.object.crdt_type();
        if op.target_type() != crdt_type {
            return Err(self.conflict(op.target_type()));
        }

        let hlc = self.ctx.bus.hlc().now();
        let node = self.ctx.bus.node_id().clone();
        let op = match op {
            LocalOp::AddBelief(belief) => {
                if belief.trim().is_empty() {
                    return Err(self.invalid("belief text is empty"));
                }
                CrdtOp::AddBelief {
                    belief,
                    tag: hlc.clone(),
                }
            }
            LocalOp::RemoveBelief(belief) => {
                let tags = self
                    .state
                    .object
                    .as_belief_set()
                    .map(|set| set.live_tags(&belief))
                    .unwrap_or_default();
                if tags.is_empty() {
                    return Err(self.invalid(format!("belief {belief:?} is not present")));
                }
                CrdtOp::RemoveBelief { belief, tags }
            }
            LocalOp::AddEdge(edge) => {
                edge.check().map_err(|reason| self.invalid(reason))?;
                CrdtOp::AddEdge { edge }
            }
            LocalOp::Increment(by) => {
                if by == 0 {
                    return Err(self.invalid("increment must be positive"));
                }
                let current = self
                    .state
                    .object
                    .as_metric_counter()
                    .map(|c| c.slot(&node))
                    .unwrap_or(0);
                let value = current
                    .checked_add(by)
                    .ok_or_else(|| self.invalid("counter slot overflow"))?;
                CrdtOp::CounterSlot {
                    node: node.clone(),
                    value,
                }
            }
        };

        let delta = Delta {
            object_type: crdt_type,
            object_id: self.state.id.clone(),
            op,
            hlc,
            origin: node,
        };
        let changed = self
            .state
            .object
            .apply(&delta.op)
            .map_err(|reason| self.invalid(reason))?;
        self.ctx.counters.local_ops.fetch_add(1, Ordering::Relaxed);
        if changed {
            self.commit(delta.clone());
        }
        Ok(delta)
    }

    fn merge(&mut self, delta: Delta) -> Result<bool> {
        self.ctx.bus.hlc().update(&delta.hlc);

        let crdt_type = self.state.object.crdt_type();
        let requested = delta.op.target_type().unwrap_or(delta.object_type);
        if delta.object_type != crdt_type {
            return Err(self.conflict(delta.object_type));
        }
        if requested != crdt_type {
            return Err(self.conflict(requested));
        }

        // An object materialised from a remote delta logs that first delta
        // even if it carried no state, so the object itself replicates on.
        let first_sight = self.state.version == 0;
        let changed = self
            .state
            .object
            .apply(&delta.op)
            .map_err(|reason| self.invalid(reason))?;

        if changed || first_sight {
            debug!(
                object = %delta.object_id,
                op = delta.op.name(),
                origin = %delta.origin,
                content_id = %delta.content_id(),
                "merged remote delta"
            );
            self.ctx.counters.merges_applied.fetch_add(1, Ordering::Relaxed);
            self.commit(delta);
            Ok(true)
        } else {
            self.ctx.counters.merges_duplicate.fetch_add(1, Ordering::Relaxed);
            Ok(false)
        }
    }

    fn commit(&mut self, delta: Delta) {
        let max_log_len = self.ctx.config.max_log_len;
        self.state.append(delta.clone(), max_log_len);
        self.ctx.version.store(self.state.version, Ordering::Release);
        publish_state_change(&self.ctx.bus, &delta, self.state.version);

        self.journal.push(delta);
        if self.journal.len() >= self.ctx.config.checkpoint_every {
            self.checkpoint = self.state.clone();
            self.journal.clear();
        }
    }

    fn restore(&mut self) {
        let max_log_len = self.ctx.config.max_log_len;
        let mut state = self.checkpoint.clone();
        for delta in &self.journal {
            if let Err(reason) = state.object.apply(&delta.op) {
                warn!(object = %state.id, %reason, "skipping journal entry during replay");
                continue;
            }
            state.append(delta.clone(), max_log_len);
        }
        self.ctx.version.store(state.version, Ordering::Release);
        self.state = state;
    }

    fn deltas_since(&self, version: u64) -> ObjectBatch {
        let state = &self.state;
        let deltas = if version >= state.version {
            Vec::new()
        } else if version >= state.log_base {
            let skip = (version - state.log_base) as usize;
            state.log.iter().skip(skip).cloned().collect()
        } else {
            vec![Delta {
                object_type: state.object.crdt_type(),
                object_id: state.id.clone(),
                op: CrdtOp::State {
                    snapshot: state.object.clone(),
                },
                hlc: self.ctx.bus.hlc().now(),
                origin: self.ctx.bus.node_id().clone(),
            }]
        };
        ObjectBatch {
            object_id: state.id.clone(),
            object_type: state.object.crdt_type(),
            from_version: version.min(state.version),
            to_version: state.version,
            deltas,
        }
    }
}
