//! The peer sync monitor.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use axon_bus::{EventBus, Topic};
use axon_clock::NodeId;
use axon_crdt::{CrdtOp, CrdtStore, ObjectBatch};
use futures::future::{join_all, BoxFuture};
use rand::Rng;
use tokio::sync::watch;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Error, Result, SafetyViolation};
use crate::peer::{Peer, PeerInfo, Transition};
use crate::protocol::{delta_count, Cursors, ExchangeRequest, ExchangeResponse, SyncRequest, SyncResponse};
use crate::report::{
    HealthLevel, HealthStatus, PeerCounts, PeerOutcome, SyncEvent, SyncMetrics, SyncSummary, TestSyncReport,
};
use crate::transport::{Discovery, PeerTransport, RequestHandler};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Move `cursor` to `to` if the batch `(from, to]` is contiguous with it.
fn advance(cursors: &mut Cursors, id: &str, from: u64, to: u64) -> u64 {
    let cursor = cursors.entry(id.to_string()).or_insert(0);
    if from <= *cursor && to > *cursor {
        *cursor = to;
    }
    *cursor
}

#[derive(Debug, Default, Clone)]
struct PeerCursors {
    /// Positions in our logs the peer has acknowledged.
    outbound: Cursors,
    /// Positions in the peer's logs we have merged.
    inbound: Cursors,
}

/// Drives replication between this node's [`CrdtStore`] and its peers.
///
/// Sync starts disabled. [`enable_sync`](Self::enable_sync) runs the
/// safety check first and refuses to turn sync on if it fails.
pub struct SyncMonitor {
    store: CrdtStore,
    bus: EventBus,
    transport: Arc<dyn PeerTransport>,
    discovery: Arc<dyn Discovery>,
    config: SyncConfig,

    enabled: AtomicBool,
    /// Bumped by `disable_sync`; rounds started under an older epoch stop.
    epoch: AtomicU64,
    rounds: AtomicU64,
    round_lock: tokio::sync::Mutex<()>,

    peers: Mutex<BTreeMap<NodeId, Peer>>,
    cursors: Mutex<HashMap<NodeId, PeerCursors>>,
    outcomes: Mutex<VecDeque<bool>>,
    metrics: Mutex<SyncMetrics>,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for SyncMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMonitor")
            .field("node", self.node_id())
            .field("enabled", &self.is_enabled())
            .field("peers", &lock(&self.peers).len())
            .finish()
    }
}

impl SyncMonitor {
    pub fn new(
        store: CrdtStore,
        transport: Arc<dyn PeerTransport>,
        discovery: Arc<dyn Discovery>,
        config: SyncConfig,
    ) -> Self {
        let bus = store.bus().clone();
        Self {
            store,
            bus,
            transport,
            discovery,
            config,
            enabled: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            rounds: AtomicU64::new(0),
            round_lock: tokio::sync::Mutex::new(()),
            peers: Mutex::new(BTreeMap::new()),
            cursors: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(VecDeque::new()),
            metrics: Mutex::new(SyncMetrics::default()),
            last_error: Mutex::new(None),
        }
    }

    /// Weak handle for registering this monitor as a request handler.
    pub fn handler(self: &Arc<Self>) -> Weak<dyn RequestHandler> {
        let weak: Weak<dyn RequestHandler> = Arc::downgrade(self) as Weak<dyn RequestHandler>;
        weak
    }

    pub fn node_id(&self) -> &NodeId {
        self.store.node_id()
    }

    pub fn store(&self) -> &CrdtStore {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.bus.publish_json(Topic::SyncLifecycle, &event) {
            warn!("failed to publish sync event: {}", e);
        }
    }

    fn emit_transitions(&self, transitions: Vec<Transition>) {
        for t in transitions {
            info!(peer = %t.peer, from = %t.from, to = %t.to, "peer state changed");
            self.emit(SyncEvent::PeerStateChanged(t));
        }
    }

    fn set_last_error(&self, error: impl Into<String>) {
        *lock(&self.last_error) = Some(error.into());
    }

    // ---- gating ---------------------------------------------------------

    /// Check that it is safe to replicate from this node right now.
    pub async fn safety_check(&self) -> std::result::Result<(), SafetyViolation> {
        let reachable = lock(&self.peers).values().filter(|p| p.is_live()).count();
        if reachable < self.config.min_peers {
            return Err(SafetyViolation::InsufficientPeers {
                required: self.config.min_peers,
                reachable,
            });
        }

        let drift_ms = self.bus.hlc().drift_ms();
        let max_ms = self.config.max_clock_drift.as_millis() as u64;
        if drift_ms > max_ms {
            return Err(SafetyViolation::ClockDrift { drift_ms, max_ms });
        }

        let report = self.store.verify().await;
        if !report.is_healthy() {
            return Err(SafetyViolation::StoreIntegrity { issues: report.issues });
        }
        Ok(())
    }

    /// Turn sync on if the safety check passes.
    pub async fn enable_sync(&self) -> Result<()> {
        if self.is_enabled() {
            return Ok(());
        }
        match self.safety_check().await {
            Ok(()) => {
                self.enabled.store(true, Ordering::Release);
                info!(node = %self.node_id(), "sync enabled");
                self.emit(SyncEvent::Enabled);
                Ok(())
            }
            Err(violation) => {
                warn!(node = %self.node_id(), "refusing to enable sync: {}", violation);
                self.set_last_error(violation.to_string());
                self.emit(SyncEvent::SafetyCheckFailed {
                    reason: violation.to_string(),
                });
                Err(Error::SafetyCheckFailed(violation))
            }
        }
    }

    /// Turn sync off. A round in flight stops after its current batch.
    pub fn disable_sync(&self) {
        let was_enabled = self.enabled.swap(false, Ordering::AcqRel);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let cancelled_round = self.round_lock.try_lock().is_err();
        if was_enabled {
            info!(node = %self.node_id(), cancelled_round, "sync disabled");
        }
        self.emit(SyncEvent::Disabled { cancelled_round });
    }

    fn cancelled(&self, epoch: u64) -> bool {
        !self.is_enabled() || self.epoch.load(Ordering::Acquire) != epoch
    }

    // ---- membership -----------------------------------------------------

    /// Pull candidates from discovery. Returns how many peers were new.
    pub async fn discover_peers(&self) -> Result<usize> {
        let candidates = self.discovery.discover().await?;
        let now = Instant::now();
        let mut added = 0;
        let mut transitions = Vec::new();
        {
            let mut peers = lock(&self.peers);
            for info in candidates {
                if info.node_id == *self.node_id() {
                    continue;
                }
                match peers.get_mut(&info.node_id) {
                    Some(peer) => {
                        peer.address = info.address;
                        transitions.extend(peer.begin_check());
                    }
                    None => {
                        debug!(peer = %info.node_id, address = %info.address, "discovered peer");
                        peers.insert(info.node_id.clone(), Peer::new(info, now));
                        added += 1;
                    }
                }
            }
        }
        self.emit_transitions(transitions);
        if added > 0 {
            info!(node = %self.node_id(), added, "new peers discovered");
        }
        Ok(added)
    }

    /// Ping every known peer and update its state. Returns how many answered.
    pub async fn heartbeat(&self) -> usize {
        let targets: Vec<PeerInfo> = {
            let mut peers = lock(&self.peers);
            let mut transitions = Vec::new();
            let targets = peers
                .values_mut()
                .map(|peer| {
                    transitions.extend(peer.begin_check());
                    PeerInfo::new(peer.node_id.clone(), peer.address.clone())
                })
                .collect();
            drop(peers);
            self.emit_transitions(transitions);
            targets
        };

        let pings = targets.iter().map(|peer| async move {
            let started = Instant::now();
            let outcome = self.ping(peer).await;
            (peer.node_id.clone(), outcome.map(|_| started.elapsed()))
        });
        let results = join_all(pings).await;

        let now = Instant::now();
        let mut answered = 0;
        let mut transitions = Vec::new();
        {
            let mut peers = lock(&self.peers);
            for (node, result) in results {
                let Some(peer) = peers.get_mut(&node) else { continue };
                match result {
                    Ok(latency) => {
                        answered += 1;
                        transitions.extend(peer.record_success(now, latency));
                    }
                    Err(e) => {
                        debug!(peer = %node, error = %e, "heartbeat failed");
                        transitions.extend(peer.record_failure(e.to_string(), self.config.unreachable_after_failures));
                    }
                }
            }
        }
        self.emit_transitions(transitions);
        self.reap();
        answered
    }

    async fn ping(&self, peer: &PeerInfo) -> Result<SyncResponse> {
        let request = SyncRequest::Ping {
            from: self.node_id().clone(),
            hlc: self.bus.hlc().now(),
        };
        let deadline = self.config.ping_timeout;
        let response = timeout(deadline, self.transport.exchange(peer, request))
            .await
            .map_err(|_| Error::DeadlineExceeded {
                peer: peer.node_id.clone(),
                after: deadline,
            })??;
        match &response {
            SyncResponse::Pong { hlc, .. } => {
                self.bus.hlc().update(hlc);
                Ok(response)
            }
            SyncResponse::Exchange(_) => Err(Error::Protocol("exchange response to a ping".into())),
        }
    }

    /// Mark silent peers unreachable and forget long-silent ones.
    fn reap(&self) {
        let now = Instant::now();
        let mut transitions = Vec::new();
        let mut evicted = Vec::new();
        {
            let mut peers = lock(&self.peers);
            peers.retain(|node, peer| {
                let silence = peer.silence(now);
                if silence > self.config.eviction_window {
                    evicted.push(node.clone());
                    return false;
                }
                if silence > self.config.silence_window {
                    transitions.extend(peer.mark_unreachable());
                }
                true
            });
        }
        if !evicted.is_empty() {
            let mut cursors = lock(&self.cursors);
            for node in &evicted {
                cursors.remove(node);
            }
        }
        self.emit_transitions(transitions);
        for peer in evicted {
            info!(%peer, "evicted silent peer");
            self.emit(SyncEvent::PeerEvicted { peer });
        }
    }

    pub fn peers(&self) -> Vec<Peer> {
        lock(&self.peers).values().cloned().collect()
    }

    /// Peers currently answering.
    pub fn live_peers(&self) -> Vec<PeerInfo> {
        lock(&self.peers)
            .values()
            .filter(|p| p.is_live())
            .map(|p| PeerInfo::new(p.node_id.clone(), p.address.clone()))
            .collect()
    }

    // ---- replication ----------------------------------------------------

    /// One replication round with every reachable peer, concurrently.
    ///
    /// Individual peer failures are reported in the summary and folded into
    /// peer state; they never fail the call.
    pub async fn sync_with_peers(&self) -> Result<SyncSummary> {
        if !self.is_enabled() {
            return Err(Error::SyncDisabled);
        }
        let _round = self.round_lock.lock().await;
        if !self.is_enabled() {
            return Err(Error::SyncDisabled);
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        let round = self.rounds.fetch_add(1, Ordering::AcqRel) + 1;
        let started = Instant::now();
        let targets: Vec<PeerInfo> = lock(&self.peers)
            .values()
            .filter(|p| p.is_eligible())
            .map(|p| PeerInfo::new(p.node_id.clone(), p.address.clone()))
            .collect();

        let exchanges = targets.iter().map(|peer| async move {
            let outcome = self.sync_peer(peer, epoch).await;
            (peer.node_id.clone(), outcome)
        });
        let outcomes: BTreeMap<NodeId, PeerOutcome> = join_all(exchanges).await.into_iter().collect();
        let duration = started.elapsed();

        self.record_round(&outcomes, duration);
        let summary = SyncSummary {
            round,
            duration_ms: duration.as_millis() as u64,
            peers: outcomes,
        };
        if summary.was_cancelled() {
            info!(round, "sync round cancelled");
        } else {
            debug!(
                round,
                succeeded = summary.succeeded(),
                failed = summary.failed(),
                "sync round completed"
            );
        }
        self.emit(SyncEvent::RoundCompleted {
            round,
            succeeded: summary.succeeded(),
            failed: summary.failed(),
            duration_ms: summary.duration_ms,
        });
        Ok(summary)
    }

    fn record_round(&self, outcomes: &BTreeMap<NodeId, PeerOutcome>, duration: Duration) {
        let now = Instant::now();
        let mut transitions = Vec::new();
        {
            let mut peers = lock(&self.peers);
            let mut metrics = lock(&self.metrics);
            let mut history = lock(&self.outcomes);
            metrics.rounds += 1;
            metrics.last_round_ms = Some(duration.as_millis() as u64);

            for (node, outcome) in outcomes {
                match outcome {
                    PeerOutcome::Synced {
                        sent,
                        received,
                        applied,
                        latency_ms,
                    } => {
                        metrics.exchanges_ok += 1;
                        metrics.deltas_sent += *sent as u64;
                        metrics.deltas_received += *received as u64;
                        metrics.deltas_applied += *applied as u64;
                        metrics.peer_latency_ms.insert(node.clone(), *latency_ms);
                        history.push_back(true);
                        if let Some(peer) = peers.get_mut(node) {
                            transitions.extend(peer.record_success(now, Duration::from_millis(*latency_ms)));
                        }
                    }
                    PeerOutcome::Failed { reason } => {
                        metrics.exchanges_failed += 1;
                        history.push_back(false);
                        if let Some(peer) = peers.get_mut(node) {
                            transitions
                                .extend(peer.record_failure(reason.clone(), self.config.unreachable_after_failures));
                        }
                    }
                    PeerOutcome::Cancelled => {}
                }
            }
            if outcomes.values().any(|o| matches!(o, PeerOutcome::Cancelled)) {
                metrics.rounds_cancelled += 1;
            }
            while history.len() > self.config.outcome_history {
                history.pop_front();
            }
        }
        self.emit_transitions(transitions);
    }

    async fn sync_peer(&self, peer: &PeerInfo, epoch: u64) -> PeerOutcome {
        let started = Instant::now();
        let known = lock(&self.cursors).get(&peer.node_id).cloned().unwrap_or_default();

        let mut batches = Vec::new();
        for (id, version) in self.store.versions() {
            if self.cancelled(epoch) {
                return PeerOutcome::Cancelled;
            }
            let cursor = known.outbound.get(&id).copied().unwrap_or(0);
            if version <= cursor {
                continue;
            }
            match self.store.deltas_since(&id, cursor).await {
                Ok(batch) => batches.push(without_echoes(batch, &peer.node_id)),
                Err(e) => warn!(object = %id, error = %e, "skipping object in push"),
            }
        }
        let sent = delta_count(&batches);

        let request = SyncRequest::Exchange(ExchangeRequest {
            from: self.node_id().clone(),
            hlc: self.bus.hlc().now(),
            batches,
            cursors: known.inbound,
        });
        let deadline = self.config.exchange_timeout;
        let response = match timeout(deadline, self.transport.exchange(peer, request)).await {
            Err(_) => {
                let reason = format!("no answer within {deadline:?}");
                warn!(peer = %peer.node_id, "sync exchange failed: {}", reason);
                return PeerOutcome::Failed { reason };
            }
            Ok(Err(e)) => {
                warn!(peer = %peer.node_id, "sync exchange failed: {}", e);
                return PeerOutcome::Failed { reason: e.to_string() };
            }
            Ok(Ok(SyncResponse::Exchange(response))) => response,
            Ok(Ok(SyncResponse::Pong { .. })) => {
                return PeerOutcome::Failed {
                    reason: "peer answered an exchange with a pong".into(),
                };
            }
        };
        let latency = started.elapsed();
        let ExchangeResponse {
            hlc, acked, batches, ..
        } = response;
        self.bus.hlc().update(&hlc);

        {
            let mut cursors = lock(&self.cursors);
            let entry = cursors.entry(peer.node_id.clone()).or_default();
            for (id, version) in acked {
                let cursor = entry.outbound.entry(id).or_insert(0);
                *cursor = (*cursor).max(version);
            }
        }

        let received = delta_count(&batches);
        let mut applied = 0;
        for batch in batches {
            if self.cancelled(epoch) {
                return PeerOutcome::Cancelled;
            }
            applied += self.absorb(&peer.node_id, batch).await.0;
        }

        PeerOutcome::Synced {
            sent,
            received,
            applied,
            latency_ms: latency.as_millis() as u64,
        }
    }

    /// Merge a batch from `peer`. Returns how many deltas changed state and
    /// the resulting inbound cursor for the object.
    async fn absorb(&self, peer: &NodeId, batch: ObjectBatch) -> (usize, u64) {
        let ObjectBatch {
            object_id,
            from_version,
            to_version,
            deltas,
            ..
        } = batch;

        let mut applied = 0;
        let mut complete = true;
        for delta in deltas {
            match self.store.merge_remote_delta(delta).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                // Permanent for this delta; retrying will not help.
                Err(e @ (axon_crdt::Error::TypeConflict { .. } | axon_crdt::Error::InvalidOp { .. })) => {
                    warn!(%peer, object = %object_id, error = %e, "rejected remote delta");
                }
                Err(e) => {
                    warn!(%peer, object = %object_id, error = %e, "merge interrupted");
                    complete = false;
                    break;
                }
            }
        }

        let mut cursors = lock(&self.cursors);
        let inbound = &mut cursors.entry(peer.clone()).or_default().inbound;
        let cursor = if complete {
            advance(inbound, &object_id, from_version, to_version)
        } else {
            inbound.get(&object_id).copied().unwrap_or(0)
        };
        (applied, cursor)
    }

    /// Serve one request from a peer.
    pub async fn handle_request(&self, request: SyncRequest) -> Result<SyncResponse> {
        let request = match request {
            SyncRequest::Ping { hlc, .. } => {
                self.bus.hlc().update(&hlc);
                return Ok(SyncResponse::Pong {
                    from: self.node_id().clone(),
                    hlc: self.bus.hlc().now(),
                });
            }
            SyncRequest::Exchange(request) => request,
        };
        if !self.is_enabled() {
            return Err(Error::SyncDisabled);
        }

        let ExchangeRequest {
            from,
            hlc,
            batches,
            cursors,
        } = request;
        self.bus.hlc().update(&hlc);

        let received = delta_count(&batches);
        let mut applied = 0;
        let mut acked = Cursors::new();
        for batch in batches {
            let id = batch.object_id.clone();
            let (n, cursor) = self.absorb(&from, batch).await;
            applied += n;
            acked.insert(id, cursor);
        }

        let mut reply = Vec::new();
        for (id, version) in self.store.versions() {
            let cursor = cursors.get(&id).copied().unwrap_or(0);
            if version <= cursor {
                continue;
            }
            match self.store.deltas_since(&id, cursor).await {
                Ok(batch) => reply.push(without_echoes(batch, &from)),
                Err(e) => warn!(object = %id, error = %e, "skipping object in reply"),
            }
        }

        {
            let mut metrics = lock(&self.metrics);
            metrics.requests_served += 1;
            metrics.deltas_received += received as u64;
            metrics.deltas_applied += applied as u64;
            metrics.deltas_sent += delta_count(&reply) as u64;
        }
        debug!(peer = %from, received, applied, sent = delta_count(&reply), "served sync exchange");

        Ok(SyncResponse::Exchange(ExchangeResponse {
            from: self.node_id().clone(),
            hlc: self.bus.hlc().now(),
            acked,
            batches: reply,
        }))
    }

    // ---- diagnostics ----------------------------------------------------

    /// One exchange round trip with a single peer.
    ///
    /// The request pushes nothing and the reply batches are dropped
    /// unmerged, so neither the store, the cursors, peer health nor the
    /// enable state change. Only an unknown peer or an empty peer table is
    /// an error; exchange failures land in the report.
    pub async fn test_sync(&self, peer: Option<&NodeId>) -> Result<TestSyncReport> {
        let target = {
            let peers = lock(&self.peers);
            let chosen = match peer {
                Some(id) => Some(peers.get(id).ok_or_else(|| Error::UnknownPeer(id.clone()))?),
                None => peers
                    .values()
                    .find(|p| p.is_live())
                    .or_else(|| peers.values().next()),
            };
            chosen
                .map(|p| PeerInfo::new(p.node_id.clone(), p.address.clone()))
                .ok_or(Error::NoPeers)?
        };

        let inbound = lock(&self.cursors)
            .get(&target.node_id)
            .map(|c| c.inbound.clone())
            .unwrap_or_default();
        let request = SyncRequest::Exchange(ExchangeRequest {
            from: self.node_id().clone(),
            hlc: self.bus.hlc().now(),
            batches: Vec::new(),
            cursors: inbound,
        });

        let deadline = self.config.exchange_timeout;
        let started = Instant::now();
        let outcome = match timeout(deadline, self.transport.exchange(&target, request)).await {
            Err(_) => Err(Error::DeadlineExceeded {
                peer: target.node_id.clone(),
                after: deadline,
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(SyncResponse::Exchange(response))) => Ok(response.hlc),
            Ok(Ok(SyncResponse::Pong { .. })) => Err(Error::Protocol("pong in answer to an exchange".into())),
        };
        let latency = started.elapsed();

        let report = match outcome {
            Ok(hlc) => {
                self.bus.hlc().update(&hlc);
                TestSyncReport {
                    peer: target.node_id,
                    success: true,
                    latency,
                    remote_hlc: Some(hlc),
                    error: None,
                }
            }
            Err(e) => {
                debug!(peer = %target.node_id, error = %e, "test sync failed");
                TestSyncReport {
                    peer: target.node_id,
                    success: false,
                    latency,
                    remote_hlc: None,
                    error: Some(e.to_string()),
                }
            }
        };
        Ok(report)
    }

    pub fn health_status(&self) -> HealthStatus {
        let mut counts = PeerCounts::default();
        for peer in lock(&self.peers).values() {
            counts.count(peer.state);
        }
        let success_ratio = {
            let history = lock(&self.outcomes);
            if history.is_empty() {
                1.0
            } else {
                history.iter().filter(|ok| **ok).count() as f64 / history.len() as f64
            }
        };
        let sync_enabled = self.is_enabled();
        let level = if !sync_enabled {
            HealthLevel::Disabled
        } else if counts.live() == 0 {
            HealthLevel::Critical
        } else if counts.live() < self.config.min_peers || success_ratio < 0.8 {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        };
        HealthStatus {
            sync_enabled,
            level,
            peers: counts,
            success_ratio,
            last_error: lock(&self.last_error).clone(),
        }
    }

    pub fn metrics(&self) -> SyncMetrics {
        lock(&self.metrics).clone()
    }

    // ---- background loop ------------------------------------------------

    /// Drive discovery, heartbeats and sync rounds until `shutdown` flips to
    /// true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(node = %self.node_id(), "sync monitor started");
        let mut discovery = tokio::time::interval(self.config.discovery_interval);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut sync = tokio::time::interval(self.config.sync_interval);
        for ticker in [&mut discovery, &mut heartbeat, &mut sync] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = discovery.tick() => {
                    if let Err(e) = self.discover_peers().await {
                        warn!("peer discovery failed: {}", e);
                    }
                }
                _ = heartbeat.tick() => {
                    let spread = self.config.heartbeat_interval.as_millis() as u64 / 10;
                    let jitter = rand::thread_rng().gen_range(0..=spread);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                    self.heartbeat().await;
                }
                _ = sync.tick(), if self.is_enabled() => {
                    match self.sync_with_peers().await {
                        Ok(_) | Err(Error::SyncDisabled) => {}
                        Err(e) => warn!("sync round failed: {}", e),
                    }
                }
            }
        }
        info!(node = %self.node_id(), "sync monitor stopped");
    }
}

/// Drop deltas that originated at `peer`; it already has them. The batch
/// keeps its version range so the peer's cursor still advances.
fn without_echoes(mut batch: ObjectBatch, peer: &NodeId) -> ObjectBatch {
    batch
        .deltas
        .retain(|d| d.origin != *peer || matches!(d.op, CrdtOp::State { .. }));
    batch
}

impl RequestHandler for SyncMonitor {
    fn serve(&self, request: SyncRequest) -> BoxFuture<'_, Result<SyncResponse>> {
        Box::pin(self.handle_request(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::SyncEvent;
    use crate::transport::{MemoryNetwork, StaticDiscovery};
    use axon_bus::Topic;
    use axon_clock::{Hlc, Timestamp};
    use std::collections::BTreeSet;

    fn node_id(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn join(network: &Arc<MemoryNetwork>, id: &str, config: SyncConfig) -> Arc<SyncMonitor> {
        let bus = EventBus::new(Arc::new(Hlc::new(node_id(id))));
        let store = CrdtStore::new(bus);
        let transport = Arc::new(network.transport(node_id(id)));
        let monitor = Arc::new(SyncMonitor::new(store, transport.clone(), transport, config));
        network.register(node_id(id), monitor.handler());
        monitor
    }

    async fn ready(monitors: &[&Arc<SyncMonitor>]) {
        for m in monitors {
            m.discover_peers().await.unwrap();
        }
        for m in monitors {
            m.heartbeat().await;
        }
        for m in monitors {
            m.enable_sync().await.unwrap();
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn sync_is_off_until_enabled() {
        let network = MemoryNetwork::new();
        let a = join(&network, "a", SyncConfig::default());

        assert!(matches!(a.sync_with_peers().await, Err(Error::SyncDisabled)));
        let health = a.health_status();
        assert!(!health.sync_enabled);
        assert_eq!(health.level, HealthLevel::Disabled);
    }

    #[tokio::test]
    async fn failed_safety_check_keeps_sync_disabled() {
        let network = MemoryNetwork::new();
        let a = join(&network, "a", SyncConfig::default().with_min_peers(2));
        let _b = join(&network, "b", SyncConfig::default());
        let events = a.store().bus().subscribe(Topic::SyncLifecycle).unwrap();

        a.discover_peers().await.unwrap();
        a.heartbeat().await;
        let err = a.enable_sync().await.unwrap_err();
        assert!(matches!(
            err,
            Error::SafetyCheckFailed(SafetyViolation::InsufficientPeers { required: 2, reachable: 1 })
        ));
        assert!(err.to_string().contains("min_peers"));

        let health = a.health_status();
        assert!(!health.sync_enabled);
        assert!(health.last_error.is_some());

        let kinds: Vec<SyncEvent> = std::iter::from_fn(|| events.try_recv())
            .map(|e| e.payload_as().unwrap())
            .collect();
        assert!(kinds
            .iter()
            .any(|e| matches!(e, SyncEvent::SafetyCheckFailed { .. })));
    }

    #[tokio::test]
    async fn clock_drift_blocks_enable() {
        let network = MemoryNetwork::new();
        let a = join(&network, "a", SyncConfig::default().with_min_peers(0));
        let far_future = a.store().bus().hlc().peek().physical_ms + 60_000;
        a.store()
            .bus()
            .hlc()
            .update(&Timestamp::new(far_future, 0, node_id("skewed")));

        let err = a.enable_sync().await.unwrap_err();
        assert!(matches!(
            err,
            Error::SafetyCheckFailed(SafetyViolation::ClockDrift { .. })
        ));
        assert!(!a.is_enabled());
    }

    #[tokio::test]
    async fn one_round_converges_two_nodes() {
        let network = MemoryNetwork::new();
        let a = join(&network, "a", SyncConfig::default());
        let b = join(&network, "b", SyncConfig::default());
        ready(&[&a, &b]).await;

        a.store().create_belief_set("agent1").await.unwrap();
        a.store().add_belief("agent1", "x").await.unwrap();
        b.store().create_belief_set("agent1").await.unwrap();
        b.store().add_belief("agent1", "y").await.unwrap();

        let summary = a.sync_with_peers().await.unwrap();
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(a.store().beliefs("agent1").await.unwrap(), set(&["x", "y"]));
        assert_eq!(b.store().beliefs("agent1").await.unwrap(), set(&["x", "y"]));

        // Nothing new: the next round moves no deltas.
        let again = a.sync_with_peers().await.unwrap();
        assert!(matches!(
            again.peers[&node_id("b")],
            PeerOutcome::Synced { sent: 0, received: 0, .. }
        ));
        assert_eq!(a.health_status().level, HealthLevel::Healthy);
        assert!(a.metrics().deltas_applied >= 1);
    }

    #[tokio::test]
    async fn deltas_propagate_through_an_intermediate_node() {
        let network = MemoryNetwork::new();
        let a = join(&network, "a", SyncConfig::default());
        let b = join(&network, "b", SyncConfig::default());
        let c = join(&network, "c", SyncConfig::default());
        ready(&[&a, &b, &c]).await;

        a.store().create_metric_counter("requests").await.unwrap();
        a.store().increment_metric("requests", 4).await.unwrap();

        // b pulls from a, then a drops off and b relays to c.
        b.sync_with_peers().await.unwrap();
        network.set_reachable(&node_id("a"), false);
        b.sync_with_peers().await.unwrap();

        assert_eq!(c.store().metric_value("requests").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_fail_the_round() {
        let network = MemoryNetwork::new();
        let a = join(&network, "a", SyncConfig::default());
        let b = join(&network, "b", SyncConfig::default());
        let _c = join(&network, "c", SyncConfig::default());
        ready(&[&a, &b]).await;

        a.store().create_context_graph("ctx").await.unwrap();
        a.store().add_context_relationship("ctx", "s", "p", "o").await.unwrap();
        network.set_reachable(&node_id("c"), false);

        let summary = a.sync_with_peers().await.unwrap();
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(b.store().relationships("ctx").await.unwrap().len(), 1);

        let c_state = a.peers().into_iter().find(|p| p.node_id == node_id("c")).unwrap().state;
        assert_eq!(c_state, crate::PeerState::Degraded);
        assert_eq!(a.metrics().exchanges_failed, 1);
    }

    #[tokio::test]
    async fn repeated_failures_isolate_a_peer() {
        let network = MemoryNetwork::new();
        let a = join(&network, "a", SyncConfig::default().with_unreachable_after_failures(2));
        let _b = join(&network, "b", SyncConfig::default());
        a.discover_peers().await.unwrap();
        assert_eq!(a.heartbeat().await, 1);

        network.set_reachable(&node_id("b"), false);
        assert_eq!(a.heartbeat().await, 0);
        assert_eq!(a.heartbeat().await, 0);
        assert_eq!(a.peers()[0].state, crate::PeerState::Unreachable);
        assert!(a.live_peers().is_empty());

        network.set_reachable(&node_id("b"), true);
        a.heartbeat().await;
        assert_eq!(a.peers()[0].state, crate::PeerState::Syncing);
    }

    #[tokio::test]
    async fn silent_peers_are_evicted() {
        let network = MemoryNetwork::new();
        let config = SyncConfig::default()
            .with_silence_window(Duration::from_millis(20))
            .with_eviction_window(Duration::from_millis(60))
            .with_unreachable_after_failures(10);
        let a = join(&network, "a", config);
        let _b = join(&network, "b", SyncConfig::default());
        a.discover_peers().await.unwrap();
        a.heartbeat().await;

        network.set_reachable(&node_id("b"), false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        a.heartbeat().await;
        assert_eq!(a.peers()[0].state, crate::PeerState::Unreachable);

        tokio::time::sleep(Duration::from_millis(40)).await;
        a.heartbeat().await;
        assert!(a.peers().is_empty());
    }

    #[tokio::test]
    async fn test_sync_leaves_state_untouched() {
        let network = MemoryNetwork::new();
        let a = join(&network, "a", SyncConfig::default().with_exchange_timeout(Duration::from_millis(50)));
        let b = join(&network, "b", SyncConfig::default());

        assert!(matches!(a.test_sync(None).await, Err(Error::NoPeers)));
        ready(&[&a, &b]).await;
        a.disable_sync();
        b.store().create_belief_set("agent1").await.unwrap();
        b.store().add_belief("agent1", "x").await.unwrap();

        let report = a.test_sync(None).await.unwrap();
        assert_eq!(report.peer, node_id("b"));
        assert!(report.success);
        assert!(report.remote_hlc.is_some());
        assert!(report.error.is_none());
        assert!(!a.is_enabled());
        // The reply carried b's delta but it was not merged.
        assert!(matches!(a.store().beliefs("agent1").await, Err(axon_crdt::Error::NotFound(_))));

        network.set_node_latency(&node_id("b"), Duration::from_millis(200));
        let report = a.test_sync(Some(&node_id("b"))).await.unwrap();
        assert!(!report.success);
        assert!(report.latency >= Duration::from_millis(50));
        assert!(report.error.unwrap().contains("b"));
        assert_eq!(a.peers()[0].state, crate::PeerState::Syncing);
        assert_eq!(a.peers()[0].consecutive_failures, 0);

        assert!(matches!(
            a.test_sync(Some(&node_id("zz"))).await,
            Err(Error::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn disabling_cancels_the_round_in_flight() {
        let network = MemoryNetwork::new();
        let a = join(&network, "a", SyncConfig::default());
        let b = join(&network, "b", SyncConfig::default());
        ready(&[&a, &b]).await;
        b.store().create_belief_set("agent2").await.unwrap();
        b.store().add_belief("agent2", "z").await.unwrap();

        network.set_node_latency(&node_id("b"), Duration::from_millis(80));
        let round = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.sync_with_peers().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.disable_sync();

        let summary = round.await.unwrap().unwrap();
        assert!(summary.was_cancelled());
        assert_eq!(a.metrics().rounds_cancelled, 1);
        assert!(matches!(a.store().beliefs("agent2").await, Err(axon_crdt::Error::NotFound(_))));
        assert!(matches!(a.sync_with_peers().await, Err(Error::SyncDisabled)));
    }

    #[tokio::test]
    async fn test_sync_reports_a_peer_that_refuses_exchanges() {
        let network = MemoryNetwork::new();
        let a = join(&network, "a", SyncConfig::default());
        let b = join(&network, "b", SyncConfig::default());
        ready(&[&a, &b]).await;
        b.disable_sync();

        let summary = a.sync_with_peers().await.unwrap();
        assert_eq!(summary.failed(), 1);

        // b still answers heartbeats but refuses every exchange.
        assert_eq!(a.heartbeat().await, 1);
        let report = a.test_sync(Some(&node_id("b"))).await.unwrap();
        assert!(!report.success);
        assert!(report.remote_hlc.is_none());
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn static_discovery_registers_configured_peers() {
        let network = MemoryNetwork::new();
        let bus = EventBus::new(Arc::new(Hlc::new(node_id("a"))));
        let transport = Arc::new(network.transport(node_id("a")));
        let discovery = Arc::new(StaticDiscovery::new(vec![
            PeerInfo::new(node_id("a"), "mem://a"),
            PeerInfo::new(node_id("b"), "mem://b"),
        ]));
        let a = SyncMonitor::new(CrdtStore::new(bus), transport, discovery, SyncConfig::default());

        assert_eq!(a.discover_peers().await.unwrap(), 1);
        assert_eq!(a.discover_peers().await.unwrap(), 0);
        // b is not on the network; the heartbeat degrades it.
        assert_eq!(a.heartbeat().await, 0);
        assert_eq!(a.health_status().peers.degraded, 1);
    }
}
