//! The CRDT store: a registry of object workers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use axon_bus::EventBus;
use axon_clock::NodeId;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::delta::{CrdtOp, CrdtType, Delta, LocalOp, ObjectBatch};
use crate::error::{Error, Result};
use crate::worker::{
    self, Command, ObjectSnapshot, ObjectState, StoreConfig, StoreCounters, WorkerContext,
};
use crate::Edge;

/// Outcome of a create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    New,
    /// An object of the same type already existed and was left as is.
    Existing,
}

/// One entry of [`CrdtStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub object_id: String,
    pub object_type: CrdtType,
    pub version: u64,
}

/// Point-in-time store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub objects: usize,
    pub by_type: BTreeMap<CrdtType, usize>,
    pub local_ops: u64,
    pub merges_applied: u64,
    pub merges_duplicate: u64,
    pub type_conflicts: u64,
    pub worker_restarts: u64,
}

/// Result of [`CrdtStore::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    /// `(object_id, problem)` for every object that failed.
    pub issues: Vec<(String, String)>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Clone)]
struct ObjectHandle {
    crdt_type: CrdtType,
    tx: mpsc::Sender<Command>,
    version: Arc<AtomicU64>,
}

struct StoreInner {
    bus: EventBus,
    config: StoreConfig,
    counters: Arc<StoreCounters>,
    objects: RwLock<HashMap<String, ObjectHandle>>,
}

/// Node-local registry of replicated objects.
///
/// Cheap to clone; all clones share the same objects. Workers stop once
/// every clone is dropped.
#[derive(Clone)]
pub struct CrdtStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for CrdtStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtStore")
            .field("node", self.node_id())
            .field("objects", &self.read().len())
            .finish()
    }
}

impl CrdtStore {
    pub fn new(bus: EventBus) -> Self {
        Self::with_config(bus, StoreConfig::default())
    }

    pub fn with_config(bus: EventBus, config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                bus,
                config,
                counters: Arc::new(StoreCounters::default()),
                objects: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        self.inner.bus.node_id()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ObjectHandle>> {
        self.inner.objects.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ObjectHandle>> {
        self.inner.objects.write().unwrap_or_else(|p| p.into_inner())
    }

    fn context(&self) -> WorkerContext {
        WorkerContext {
            bus: self.inner.bus.clone(),
            config: self.inner.config.clone(),
            counters: Arc::clone(&self.inner.counters),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    fn start_worker(&self, state: ObjectState, crdt_type: CrdtType) -> ObjectHandle {
        let ctx = self.context();
        let version = Arc::clone(&ctx.version);
        let tx = worker::spawn(state, ctx);
        ObjectHandle {
            crdt_type,
            tx,
            version,
        }
    }

    fn handle(&self, id: &str) -> Result<ObjectHandle> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn conflict(&self, id: &str, existing: CrdtType, requested: CrdtType) -> Error {
        self.inner.counters.type_conflicts.fetch_add(1, Ordering::Relaxed);
        warn!(object = %id, %existing, %requested, "type conflict");
        Error::TypeConflict {
            id: id.to_string(),
            existing,
            requested,
        }
    }

    async fn request<T>(
        &self,
        id: &str,
        handle: &ObjectHandle,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(command(tx))
            .await
            .map_err(|_| Error::WorkerGone(id.to_string()))?;
        rx.await.map_err(|_| Error::WorkerGone(id.to_string()))
    }

    /// Create an object. Re-creating with the same type is a no-op.
    pub async fn create(&self, crdt_type: CrdtType, id: &str) -> Result<Created> {
        if id.trim().is_empty() {
            return Err(Error::InvalidOp {
                id: id.to_string(),
                reason: "object id is empty".into(),
            });
        }

        let delta = {
            let mut objects = self.write();
            if let Some(existing) = objects.get(id).map(|h| h.crdt_type) {
                if existing == crdt_type {
                    return Ok(Created::Existing);
                }
                drop(objects);
                return Err(self.conflict(id, existing, crdt_type));
            }

            let delta = Delta {
                object_type: crdt_type,
                object_id: id.to_string(),
                op: CrdtOp::Create,
                hlc: self.inner.bus.hlc().now(),
                origin: self.node_id().clone(),
            };
            let mut state = ObjectState::new(id.to_string(), crdt_type);
            state.append(delta.clone(), self.inner.config.max_log_len);
            let handle = self.start_worker(state, crdt_type);
            objects.insert(id.to_string(), handle);
            delta
        };

        self.inner.counters.local_ops.fetch_add(1, Ordering::Relaxed);
        worker::publish_state_change(&self.inner.bus, &delta, 1);
        info!(object = %id, %crdt_type, "created CRDT object");
        Ok(Created::New)
    }

    /// Apply a local operation and return the delta to replicate.
    pub async fn apply_local_op(&self, id: &str, op: LocalOp) -> Result<Delta> {
        let handle = self.handle(id)?;
        if handle.crdt_type != op.target_type() {
            return Err(self.conflict(id, handle.crdt_type, op.target_type()));
        }
        self.request(id, &handle, |reply| Command::Apply { op, reply })
            .await?
    }

    /// Join a delta from another node. Returns whether local state changed.
    ///
    /// An unknown id is materialised from the delta; if that first merge is
    /// rejected the object is dropped again.
    pub async fn merge_remote_delta(&self, delta: Delta) -> Result<bool> {
        let id = delta.object_id.clone();
        if let Some(requested) = delta.op.target_type() {
            if requested != delta.object_type {
                self.inner.bus.hlc().update(&delta.hlc);
                return Err(self.conflict(&id, delta.object_type, requested));
            }
        }

        let (handle, materialised) = {
            let mut objects = self.write();
            match objects.get(&id) {
                Some(handle) => (handle.clone(), false),
                None => {
                    debug!(object = %id, object_type = %delta.object_type, "materialising object from remote delta");
                    let state = ObjectState::new(id.clone(), delta.object_type);
                    let handle = self.start_worker(state, delta.object_type);
                    objects.insert(id.clone(), handle.clone());
                    (handle, true)
                }
            }
        };
        if handle.crdt_type != delta.object_type {
            self.inner.bus.hlc().update(&delta.hlc);
            return Err(self.conflict(&id, handle.crdt_type, delta.object_type));
        }

        let result = self
            .request(&id, &handle, |reply| Command::Merge { delta, reply })
            .await
            .and_then(|merged| merged);
        if result.is_err() && materialised {
            self.discard_empty(&id, &handle);
        }
        result
    }

    /// Forget `handle` if it is still registered under `id` and holds
    /// nothing.
    fn discard_empty(&self, id: &str, handle: &ObjectHandle) {
        let mut objects = self.write();
        let unchanged = objects
            .get(id)
            .is_some_and(|h| h.tx.same_channel(&handle.tx) && h.version.load(Ordering::Acquire) == 0);
        if unchanged {
            objects.remove(id);
            debug!(object = %id, "dropped object rejected on first merge");
        }
    }

    /// Merge every delta of a batch, in order. Returns how many changed state.
    pub async fn merge_batch(&self, batch: ObjectBatch) -> Result<usize> {
        let mut changed = 0;
        for delta in batch.deltas {
            if self.merge_remote_delta(delta).await? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    pub async fn snapshot(&self, id: &str) -> Result<ObjectSnapshot> {
        let handle = self.handle(id)?;
        self.request(id, &handle, |reply| Command::Snapshot { reply })
            .await
    }

    /// All objects on this node, ordered by id.
    pub fn list(&self) -> Vec<ObjectInfo> {
        let mut list: Vec<ObjectInfo> = self
            .read()
            .iter()
            .map(|(id, handle)| ObjectInfo {
                object_id: id.clone(),
                object_type: handle.crdt_type,
                version: handle.version.load(Ordering::Acquire),
            })
            .collect();
        list.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        list
    }

    /// Object ids grouped by type.
    pub fn list_crdts(&self) -> BTreeMap<CrdtType, Vec<String>> {
        let mut grouped: BTreeMap<CrdtType, Vec<String>> = BTreeMap::new();
        for info in self.list() {
            grouped.entry(info.object_type).or_default().push(info.object_id);
        }
        grouped
    }

    /// Current version of every object.
    pub fn versions(&self) -> BTreeMap<String, u64> {
        self.read()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.version.load(Ordering::Acquire)))
            .collect()
    }

    /// Deltas committed after `version`; a single `State` delta when the
    /// log has been compacted past it.
    pub async fn deltas_since(&self, id: &str, version: u64) -> Result<ObjectBatch> {
        let handle = self.handle(id)?;
        self.request(id, &handle, |reply| Command::DeltasSince { version, reply })
            .await
    }

    pub fn get_stats(&self) -> StoreStats {
        let mut by_type = BTreeMap::new();
        let objects = {
            let objects = self.read();
            for handle in objects.values() {
                *by_type.entry(handle.crdt_type).or_insert(0) += 1;
            }
            objects.len()
        };
        let counters = &self.inner.counters;
        StoreStats {
            objects,
            by_type,
            local_ops: counters.local_ops.load(Ordering::Relaxed),
            merges_applied: counters.merges_applied.load(Ordering::Relaxed),
            merges_duplicate: counters.merges_duplicate.load(Ordering::Relaxed),
            type_conflicts: counters.type_conflicts.load(Ordering::Relaxed),
            worker_restarts: counters.restarts.load(Ordering::Relaxed),
        }
    }

    /// Ping every worker and check its invariants.
    pub async fn verify(&self) -> IntegrityReport {
        let handles: Vec<(String, ObjectHandle)> = self
            .read()
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();
        let timeout = self.inner.config.verify_timeout;

        let checks = handles.iter().map(|(id, handle)| async move {
            let outcome = tokio::time::timeout(
                timeout,
                self.request(id, handle, |reply| Command::Verify { reply }),
            )
            .await;
            let problem = match outcome {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(reason))) => Some(reason),
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("worker did not answer within {timeout:?}")),
            };
            problem.map(|p| (id.clone(), p))
        });
        let mut issues: Vec<(String, String)> = futures::future::join_all(checks)
            .await
            .into_iter()
            .flatten()
            .collect();
        issues.sort();

        IntegrityReport {
            checked: handles.len(),
            issues,
        }
    }

    pub async fn create_belief_set(&self, owner: &str) -> Result<Created> {
        self.create(CrdtType::BeliefSet, owner).await
    }

    pub async fn add_belief(&self, owner: &str, belief: impl Into<String>) -> Result<Delta> {
        self.apply_local_op(owner, LocalOp::AddBelief(belief.into())).await
    }

    pub async fn remove_belief(&self, owner: &str, belief: impl Into<String>) -> Result<Delta> {
        self.apply_local_op(owner, LocalOp::RemoveBelief(belief.into())).await
    }

    pub async fn beliefs(&self, owner: &str) -> Result<BTreeSet<String>> {
        let snapshot = self.snapshot(owner).await?;
        snapshot
            .object
            .as_belief_set()
            .map(|set| set.beliefs())
            .ok_or_else(|| self.conflict(owner, snapshot.object.crdt_type(), CrdtType::BeliefSet))
    }

    pub async fn create_context_graph(&self, id: &str) -> Result<Created> {
        self.create(CrdtType::ContextGraph, id).await
    }

    pub async fn add_context_relationship(
        &self,
        id: &str,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Result<Delta> {
        let edge = Edge::new(subject, predicate, object);
        self.apply_local_op(id, LocalOp::AddEdge(edge)).await
    }

    pub async fn relationships(&self, id: &str) -> Result<Vec<Edge>> {
        let snapshot = self.snapshot(id).await?;
        snapshot
            .object
            .as_context_graph()
            .map(|graph| graph.edges().cloned().collect())
            .ok_or_else(|| self.conflict(id, snapshot.object.crdt_type(), CrdtType::ContextGraph))
    }

    pub async fn create_metric_counter(&self, id: &str) -> Result<Created> {
        self.create(CrdtType::MetricCounter, id).await
    }

    pub async fn increment_metric(&self, id: &str, by: u64) -> Result<Delta> {
        self.apply_local_op(id, LocalOp::Increment(by)).await
    }

    pub async fn metric_value(&self, id: &str) -> Result<u64> {
        let snapshot = self.snapshot(id).await?;
        snapshot
            .object
            .as_metric_counter()
            .map(|counter| counter.value())
            .ok_or_else(|| self.conflict(id, snapshot.object.crdt_type(), CrdtType::MetricCounter))
    }

    #[cfg(test)]
    pub(crate) async fn crash_worker(&self, id: &str) -> Result<()> {
        let handle = self.handle(id)?;
        handle
            .tx
            .send(Command::Crash)
            .await
            .map_err(|_| Error::WorkerGone(id.to_string()))
    }
}
