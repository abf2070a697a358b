//! The cluster pattern aggregator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axon_bus::{EventBus, Subscriber, Topic};
use axon_clock::{NodeId, Timestamp};
use axon_crdt::{CrdtOp, CrdtStore, StateChange};
use axon_sync::SyncMonitor;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::record::{
    ClusterPatternRecord, ConsensusReached, PatternIndexed, PatternMatch, PatternMetrics, ReportOutcome,
};
use crate::search::{IndexRef, SearchBackend};
use crate::telemetry::{ClusterConnectionStats, ConnectionTelemetry};

/// Predicate of the replicated observation edges.
pub const OBSERVED_BY: &str = "observed_by";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Distinct nodes needed before `ConsensusReached` is published.
    pub consensus_quorum: usize,
    /// Per-node deadline for `search_cluster`.
    pub search_timeout: Duration,
    /// Index name passed to the search backend.
    pub index: String,
    pub observations_graph: String,
    pub indexed_metric: String,
    pub deduplicated_metric: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            consensus_quorum: 2,
            search_timeout: Duration::from_millis(500),
            index: "patterns".to_string(),
            observations_graph: "cluster.pattern_observations".to_string(),
            indexed_metric: "patterns.indexed".to_string(),
            deduplicated_metric: "patterns.deduplicated".to_string(),
        }
    }
}

impl AggregatorConfig {
    pub fn with_consensus_quorum(mut self, quorum: usize) -> Self {
        self.consensus_quorum = quorum.max(1);
        self
    }

    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout = timeout;
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }
}

/// One merged hit from a cluster-wide search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterHit {
    pub pattern_id: String,
    /// `1 / (1 + distance)`, higher is better.
    pub score: f32,
    pub distance: f32,
    /// Node whose index produced the best hit.
    pub node: NodeId,
}

/// Result of [`ClusterAggregator::search_cluster`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSearch {
    pub hits: Vec<ClusterHit>,
    /// Nodes that answered in time.
    pub responded: Vec<NodeId>,
    /// Nodes left out of this call, with the reason.
    pub missing: BTreeMap<NodeId, String>,
}

#[derive(Debug, Default)]
struct Records {
    patterns: BTreeMap<String, ClusterPatternRecord>,
    /// Patterns whose `ConsensusReached` has been published.
    announced: BTreeSet<String>,
}

/// Decides which patterns the cluster agrees on.
///
/// Reports are kept locally and mirrored into a replicated context graph
/// (`pattern -observed_by-> node`), so ordinary CRDT sync spreads every
/// node's observations to every other node.
pub struct ClusterAggregator {
    monitor: Arc<SyncMonitor>,
    backend: Arc<dyn SearchBackend>,
    telemetry: Arc<dyn ConnectionTelemetry>,
    config: AggregatorConfig,
    records: Mutex<Records>,
    /// Serialises `report_match` across its store writes.
    reporting: tokio::sync::Mutex<()>,
}

impl ClusterAggregator {
    /// Create the aggregator and the replicated objects it writes to.
    pub async fn new(
        monitor: Arc<SyncMonitor>,
        backend: Arc<dyn SearchBackend>,
        telemetry: Arc<dyn ConnectionTelemetry>,
        config: AggregatorConfig,
    ) -> Result<Self> {
        let store = monitor.store();
        store.create_context_graph(&config.observations_graph).await?;
        store.create_metric_counter(&config.indexed_metric).await?;
        store.create_metric_counter(&config.deduplicated_metric).await?;
        let aggregator = Self {
            monitor,
            backend,
            telemetry,
            config,
            records: Mutex::new(Records::default()),
            reporting: tokio::sync::Mutex::new(()),
        };
        aggregator.refresh_from_store().await?;
        Ok(aggregator)
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    fn store(&self) -> &CrdtStore {
        self.monitor.store()
    }

    fn bus(&self) -> &EventBus {
        self.store().bus()
    }

    /// Record that `node` matched `pattern_id`.
    ///
    /// Repeating a report from the same node leaves the record unchanged and
    /// only bumps the deduplicated counter.
    pub async fn report_match(
        &self,
        node: &NodeId,
        pattern_id: &str,
        vector: Option<Vec<f32>>,
    ) -> Result<ReportOutcome> {
        if pattern_id.is_empty() {
            return Err(Error::InvalidReport("pattern id is empty".to_string()));
        }
        if vector.as_ref().is_some_and(|v| v.iter().any(|x| !x.is_finite())) {
            return Err(Error::InvalidReport(format!("vector for {pattern_id} has non-finite components")));
        }

        let _reporting = self.reporting.lock().await;
        let deduplicated = lock(&self.records)
            .patterns
            .get(pattern_id)
            .is_some_and(|r| r.reporting_nodes.contains(node));

        // Store writes come first; the record only changes once they stick.
        let (outcome, announce) = if deduplicated {
            self.store()
                .increment_metric(&self.config.deduplicated_metric, 1)
                .await?;
            debug!(pattern = pattern_id, %node, "duplicate pattern report");

            let count = lock(&self.records)
                .patterns
                .get(pattern_id)
                .map_or(0, |r| r.node_count());
            let outcome = ReportOutcome {
                pattern_id: pattern_id.to_string(),
                count,
                deduplicated: true,
                consensus_reached: false,
            };
            (outcome, None)
        } else {
            let delta = self
                .store()
                .add_context_relationship(&self.config.observations_graph, pattern_id, OBSERVED_BY, node.as_str())
                .await?;
            self.store()
                .increment_metric(&self.config.indexed_metric, 1)
                .await?;

            let mut guard = lock(&self.records);
            let records = &mut *guard;
            let record = records
                .patterns
                .entry(pattern_id.to_string())
                .or_insert_with(|| ClusterPatternRecord::new(pattern_id, delta.hlc.clone()));
            record.reporting_nodes.insert(node.clone());
            if delta.hlc < record.first_seen {
                record.first_seen = delta.hlc;
            }
            if record.vector.is_none() {
                record.vector = vector;
            }
            let count = record.node_count();
            let nodes = record.reporting_nodes.clone();
            let crossed = record.is_consensus(self.config.consensus_quorum)
                && records.announced.insert(pattern_id.to_string());
            debug!(pattern = pattern_id, %node, count, "pattern indexed");
            let outcome = ReportOutcome {
                pattern_id: pattern_id.to_string(),
                count,
                deduplicated: false,
                consensus_reached: crossed,
            };
            (outcome, crossed.then_some(nodes))
        };

        self.bus().publish_json(
            Topic::PatternIndexed,
            &PatternIndexed {
                pattern_id: pattern_id.to_string(),
                node: node.clone(),
                count: outcome.count,
                deduplicated: outcome.deduplicated,
            },
        )?;
        if let Some(nodes) = announce {
            self.announce(pattern_id, nodes)?;
        }
        Ok(outcome)
    }

    fn announce(&self, pattern_id: &str, nodes: BTreeSet<NodeId>) -> Result<()> {
        info!(pattern = pattern_id, nodes = nodes.len(), "cluster consensus reached");
        self.bus().publish_json(
            Topic::ConsensusReached,
            &ConsensusReached {
                pattern_id: pattern_id.to_string(),
                nodes,
                quorum: self.config.consensus_quorum,
            },
        )?;
        Ok(())
    }

    /// Union the replicated observations into the local records.
    ///
    /// `first_seen` is the earliest stamp of an observation edge still in
    /// the graph's delta log, so nodes agree on it until the log compacts.
    /// Returns how many observations were new here.
    pub async fn refresh_from_store(&self) -> Result<usize> {
        let graph = &self.config.observations_graph;
        let edges = self.store().relationships(graph).await?;
        let stamps = self.observation_stamps().await?;

        let mut learned = 0;
        let mut announcements = Vec::new();
        {
            let mut guard = lock(&self.records);
            let records = &mut *guard;
            for edge in edges.into_iter().filter(|e| e.predicate == OBSERVED_BY) {
                let Ok(node) = NodeId::new(edge.object.as_str()) else {
                    warn!(%edge, "ignoring observation with an invalid node id");
                    continue;
                };
                let stamp = stamps.get(&edge.subject);
                let record = records.patterns.entry(edge.subject.clone()).or_insert_with(|| {
                    let first_seen = stamp.cloned().unwrap_or_else(|| self.bus().hlc().now());
                    ClusterPatternRecord::new(edge.subject.as_str(), first_seen)
                });
                if let Some(stamp) = stamp.filter(|s| **s < record.first_seen) {
                    record.first_seen = stamp.clone();
                }
                if !record.reporting_nodes.insert(node) {
                    continue;
                }
                learned += 1;
                if record.is_consensus(self.config.consensus_quorum) {
                    let nodes = record.reporting_nodes.clone();
                    if records.announced.insert(edge.subject.clone()) {
                        announcements.push((edge.subject, nodes));
                    }
                }
            }
        }

        if learned > 0 {
            debug!(learned, "merged replicated pattern observations");
        }
        for (pattern_id, nodes) in announcements {
            self.announce(&pattern_id, nodes)?;
        }
        Ok(learned)
    }

    /// Earliest logged stamp of an observation edge, per pattern.
    async fn observation_stamps(&self) -> Result<BTreeMap<String, Timestamp>> {
        let batch = self.store().deltas_since(&self.config.observations_graph, 0).await?;
        let mut stamps: BTreeMap<String, Timestamp> = BTreeMap::new();
        for delta in batch.deltas {
            let CrdtOp::AddEdge { edge } = delta.op else { continue };
            if edge.predicate != OBSERVED_BY {
                continue;
            }
            match stamps.get_mut(&edge.subject) {
                Some(stamp) if *stamp <= delta.hlc => {}
                Some(stamp) => *stamp = delta.hlc,
                None => {
                    stamps.insert(edge.subject, delta.hlc);
                }
            }
        }
        Ok(stamps)
    }

    /// Records reported by at least `min_nodes` distinct nodes, most
    /// widely observed first.
    pub fn get_consensus_patterns(&self, min_nodes: usize) -> Vec<ClusterPatternRecord> {
        let mut agreed: Vec<ClusterPatternRecord> = lock(&self.records)
            .patterns
            .values()
            .filter(|r| r.is_consensus(min_nodes))
            .cloned()
            .collect();
        agreed.sort_by(|a, b| {
            b.node_count()
                .cmp(&a.node_count())
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });
        agreed
    }

    pub fn record(&self, pattern_id: &str) -> Option<ClusterPatternRecord> {
        lock(&self.records).patterns.get(pattern_id).cloned()
    }

    /// Cluster-wide totals of the replicated pattern counters.
    pub async fn pattern_metrics(&self) -> Result<PatternMetrics> {
        Ok(PatternMetrics {
            indexed: self.store().metric_value(&self.config.indexed_metric).await?,
            deduplicated: self
                .store()
                .metric_value(&self.config.deduplicated_metric)
                .await?,
        })
    }

    /// Query this node and every live peer, merging the answers.
    ///
    /// A node that fails or misses the deadline is left out of this call
    /// only; its peer state is untouched.
    pub async fn search_cluster(&self, vector: &[f32], k: usize) -> ClusterSearch {
        if k == 0 {
            return ClusterSearch::default();
        }
        let mut targets = vec![self.monitor.node_id().clone()];
        targets.extend(self.monitor.live_peers().into_iter().map(|p| p.node_id));

        let deadline = self.config.search_timeout;
        let queries = targets.into_iter().map(|node| async move {
            let index = IndexRef::new(node.clone(), self.config.index.as_str());
            let result = match timeout(deadline, self.backend.search(&index, vector, k)).await {
                Ok(result) => result,
                Err(_) => Err(Error::DeadlineExceeded {
                    node: node.clone(),
                    after: deadline,
                }),
            };
            (node, result)
        });

        let mut search = ClusterSearch::default();
        let mut best: BTreeMap<String, ClusterHit> = BTreeMap::new();
        for (node, result) in join_all(queries).await {
            let hits = match result {
                Ok(hits) => hits,
                Err(e) => {
                    debug!(%node, "excluded from cluster search: {}", e);
                    search.missing.insert(node, e.to_string());
                    continue;
                }
            };
            for hit in hits.into_iter().filter(|h| h.distance.is_finite()) {
                let distance = hit.distance.max(0.0);
                let candidate = ClusterHit {
                    pattern_id: hit.id,
                    score: 1.0 / (1.0 + distance),
                    distance,
                    node: node.clone(),
                };
                match best.get(&candidate.pattern_id) {
                    Some(existing) if existing.score >= candidate.score => {}
                    _ => {
                        best.insert(candidate.pattern_id.clone(), candidate);
                    }
                }
            }
            search.responded.push(node);
        }

        let mut hits: Vec<ClusterHit> = best.into_values().collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });
        hits.truncate(k);
        search.hits = hits;
        search
    }

    pub fn get_cluster_connection_stats(&self) -> ClusterConnectionStats {
        ClusterConnectionStats::from_samples(self.telemetry.samples())
    }

    /// A subscriber for everything [`run`](Self::run) consumes.
    pub fn subscribe(&self) -> Result<Subscriber> {
        let mut subscriber = self.bus().subscribe(Topic::PatternMatched)?;
        subscriber.subscribe(Topic::StateChanged)?;
        Ok(subscriber)
    }

    /// Report `PatternMatched` events and pick up replicated observations
    /// until `shutdown` flips to true or the bus closes.
    pub async fn run(self: Arc<Self>, subscriber: Subscriber, mut shutdown: watch::Receiver<bool>) {
        info!(node = %self.monitor.node_id(), "cluster aggregator started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = subscriber.recv() => {
                    let Some(event) = event else { break };
                    match &event.topic {
                        Topic::PatternMatched => match event.payload_as::<PatternMatch>() {
                            Ok(m) => {
                                if let Err(e) = self.report_match(&m.node_id, &m.pattern_id, m.vector).await {
                                    warn!(pattern = %m.pattern_id, "pattern report rejected: {}", e);
                                }
                            }
                            Err(e) => warn!(event = %event.id, "malformed pattern_matched payload: {}", e),
                        },
                        Topic::StateChanged => {
                            let Ok(change) = event.payload_as::<StateChange>() else { continue };
                            if change.object_id == self.config.observations_graph
                                && change.origin != *self.monitor.node_id()
                            {
                                if let Err(e) = self.refresh_from_store().await {
                                    warn!("refreshing pattern observations failed: {}", e);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        info!(node = %self.monitor.node_id(), "cluster aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::MemorySearch;
    use crate::telemetry::ShardedConnectionCounters;
    use axon_clock::Hlc;
    use axon_sync::{MemoryNetwork, SyncConfig};
    use proptest::prelude::*;

    fn node_id(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn join(network: &Arc<MemoryNetwork>, id: &str) -> Arc<SyncMonitor> {
        let bus = EventBus::new(Arc::new(Hlc::new(node_id(id))));
        let store = CrdtStore::new(bus);
        let transport = Arc::new(network.transport(node_id(id)));
        let monitor = Arc::new(SyncMonitor::new(store, transport.clone(), transport, SyncConfig::default()));
        network.register(node_id(id), monitor.handler());
        monitor
    }

    async fn aggregator(
        monitor: Arc<SyncMonitor>,
        search: Arc<MemorySearch>,
        config: AggregatorConfig,
    ) -> ClusterAggregator {
        ClusterAggregator::new(monitor, search, Arc::new(ShardedConnectionCounters::default()), config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_reports_only_bump_the_dedup_counter() {
        let network = MemoryNetwork::new();
        let agg = aggregator(join(&network, "a"), Arc::new(MemorySearch::new()), AggregatorConfig::default()).await;

        let first = agg.report_match(&node_id("n1"), "spike", Some(vec![1.0, 2.0])).await.unwrap();
        assert!(!first.deduplicated);
        let again = agg.report_match(&node_id("n1"), "spike", None).await.unwrap();
        assert!(again.deduplicated);
        assert_eq!(again.count, 1);

        let record = agg.record("spike").unwrap();
        assert_eq!(record.node_count(), 1);
        assert_eq!(record.vector, Some(vec![1.0, 2.0]));
        assert_eq!(
            agg.pattern_metrics().await.unwrap(),
            PatternMetrics {
                indexed: 1,
                deduplicated: 1
            }
        );
    }

    #[tokio::test]
    async fn consensus_is_announced_once() {
        let network = MemoryNetwork::new();
        let monitor = join(&network, "a");
        let events = monitor.store().bus().subscribe(Topic::ConsensusReached).unwrap();
        let agg = aggregator(monitor, Arc::new(MemorySearch::new()), AggregatorConfig::default()).await;

        agg.report_match(&node_id("n1"), "spike", None).await.unwrap();
        assert!(events.try_recv().is_none());
        let second = agg.report_match(&node_id("n2"), "spike", None).await.unwrap();
        assert!(second.consensus_reached);
        agg.report_match(&node_id("n3"), "spike", None).await.unwrap();

        let announced: ConsensusReached = events.try_recv().unwrap().payload_as().unwrap();
        assert_eq!(announced.pattern_id, "spike");
        assert_eq!(announced.nodes.len(), 2);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn failed_store_write_leaves_the_record_untouched() {
        let network = MemoryNetwork::new();
        let monitor = join(&network, "a");
        let config = AggregatorConfig::default();
        // Nothing created in the store yet, so every write fails.
        let agg = ClusterAggregator {
            monitor: Arc::clone(&monitor),
            backend: Arc::new(MemorySearch::new()),
            telemetry: Arc::new(ShardedConnectionCounters::default()),
            config: config.clone(),
            records: Mutex::new(Records::default()),
            reporting: tokio::sync::Mutex::new(()),
        };
        let store = monitor.store();

        let err = agg.report_match(&node_id("n1"), "spike", None).await.unwrap_err();
        assert!(matches!(err, Error::Store(axon_crdt::Error::NotFound(_))));
        assert!(agg.record("spike").is_none());

        // The edge lands but the counter write fails.
        store.create_context_graph(&config.observations_graph).await.unwrap();
        assert!(agg.report_match(&node_id("n1"), "spike", None).await.is_err());
        assert!(agg.record("spike").is_none());

        store.create_metric_counter(&config.indexed_metric).await.unwrap();
        store.create_metric_counter(&config.deduplicated_metric).await.unwrap();
        let retry = agg.report_match(&node_id("n1"), "spike", None).await.unwrap();
        assert!(!retry.deduplicated);
        assert_eq!(retry.count, 1);
        assert_eq!(
            store.relationships(&config.observations_graph).await.unwrap(),
            vec![axon_crdt::Edge::new("spike", OBSERVED_BY, "n1")]
        );
        assert_eq!(
            agg.pattern_metrics().await.unwrap(),
            PatternMetrics {
                indexed: 1,
                deduplicated: 0
            }
        );
    }

    #[tokio::test]
    async fn first_seen_is_the_observation_stamp_on_every_node() {
        let network = MemoryNetwork::new();
        let a = join(&network, "a");
        let b = join(&network, "b");
        for m in [&a, &b] {
            m.discover_peers().await.unwrap();
        }
        for m in [&a, &b] {
            m.heartbeat().await;
            m.enable_sync().await.unwrap();
        }
        let agg_a = aggregator(a.clone(), Arc::new(MemorySearch::new()), AggregatorConfig::default()).await;
        let agg_b = aggregator(b.clone(), Arc::new(MemorySearch::new()), AggregatorConfig::default()).await;

        agg_a.report_match(&node_id("a"), "spike", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        a.sync_with_peers().await.unwrap();

        assert_eq!(agg_b.refresh_from_store().await.unwrap(), 1);
        let here = agg_a.record("spike").unwrap();
        let there = agg_b.record("spike").unwrap();
        assert_eq!(there.first_seen, here.first_seen);
        assert_eq!(there.first_seen.node.as_str(), "a");
    }

    #[tokio::test]
    async fn rejects_bad_reports() {
        let network = MemoryNetwork::new();
        let agg = aggregator(join(&network, "a"), Arc::new(MemorySearch::new()), AggregatorConfig::default()).await;

        assert!(matches!(
            agg.report_match(&node_id("n1"), "", None).await,
            Err(Error::InvalidReport(_))
        ));
        assert!(matches!(
            agg.report_match(&node_id("n1"), "p", Some(vec![f32::NAN])).await,
            Err(Error::InvalidReport(_))
        ));
        assert!(agg.get_consensus_patterns(1).is_empty());
    }

    #[tokio::test]
    async fn search_survives_a_failing_and_a_slow_peer() {
        let network = MemoryNetwork::new();
        let a = join(&network, "a");
        let b = join(&network, "b");
        let c = join(&network, "c");
        let d = join(&network, "d");
        a.discover_peers().await.unwrap();
        a.heartbeat().await;
        assert_eq!(a.live_peers().len(), 3);

        let search = Arc::new(MemorySearch::new());
        search.insert(a.node_id(), "local", vec![0.0, 1.0]);
        search.insert(b.node_id(), "near", vec![0.0, 0.5]);
        search.insert(b.node_id(), "local", vec![0.0, 3.0]);
        search.insert(c.node_id(), "broken", vec![0.0, 0.0]);
        search.set_failing(c.node_id(), true);
        search.insert(d.node_id(), "slow", vec![0.0, 0.0]);
        search.set_latency(d.node_id(), Duration::from_millis(200));

        let config = AggregatorConfig::default().with_search_timeout(Duration::from_millis(50));
        let agg = aggregator(a.clone(), search, config).await;
        let result = agg.search_cluster(&[0.0, 0.0], 2).await;

        let ids: Vec<&str> = result.hits.iter().map(|h| h.pattern_id.as_str()).collect();
        assert_eq!(ids, ["near", "local"]);
        assert_eq!(result.hits[1].node, node_id("a"));
        assert_eq!(result.hits[1].score, 0.5);
        assert_eq!(result.responded.len(), 2);
        assert!(result.missing.contains_key(&node_id("c")));
        assert!(result.missing.contains_key(&node_id("d")));

        // Query failures never touch peer health.
        assert_eq!(a.live_peers().len(), 3);
    }

    #[tokio::test]
    async fn connection_stats_come_from_telemetry() {
        let network = MemoryNetwork::new();
        let counters = Arc::new(ShardedConnectionCounters::default());
        counters.connect("algedonic", &node_id("a"));
        counters.record_message("algedonic", &node_id("a"));
        let agg = ClusterAggregator::new(
            join(&network, "a"),
            Arc::new(MemorySearch::new()),
            counters,
            AggregatorConfig::default(),
        )
        .await
        .unwrap();

        let stats = agg.get_cluster_connection_stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.live_nodes, 1);
    }

    #[tokio::test]
    async fn run_reports_pattern_matched_events() {
        let network = MemoryNetwork::new();
        let monitor = join(&network, "a");
        let bus = monitor.store().bus().clone();
        let agg = Arc::new(aggregator(monitor, Arc::new(MemorySearch::new()), AggregatorConfig::default()).await);
        let indexed = bus.subscribe(Topic::PatternIndexed).unwrap();

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&agg).run(agg.subscribe().unwrap(), shutdown));

        for node in ["n1", "n2"] {
            bus.publish_json(
                Topic::PatternMatched,
                &PatternMatch {
                    node_id: node_id(node),
                    pattern_id: "spike".to_string(),
                    vector: None,
                },
            )
            .unwrap();
        }
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(1), indexed.recv())
                .await
                .unwrap()
                .unwrap();
            let payload: PatternIndexed = event.payload_as().unwrap();
            assert_eq!(payload.pattern_id, "spike");
        }
        assert_eq!(agg.get_consensus_patterns(2).len(), 1);

        stop.send(true).unwrap();
        task.await.unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn consensus_needs_distinct_reporters(
            reports in prop::collection::vec(0usize..6, 1..20),
            min_nodes in 1usize..6,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let network = MemoryNetwork::new();
                let search = Arc::new(MemorySearch::new());
                let agg = aggregator(join(&network, "a"), search, AggregatorConfig::default()).await;

                let mut seen = BTreeSet::new();
                for n in &reports {
                    agg.report_match(&node_id(&format!("n{n}")), "p", None).await.unwrap();
                    seen.insert(*n);
                    let agreed = agg.get_consensus_patterns(min_nodes);
                    prop_assert_eq!(agreed.len() == 1, seen.len() >= min_nodes);
                }
                let metrics = agg.pattern_metrics().await.unwrap();
                prop_assert_eq!(metrics.indexed, seen.len() as u64);
                prop_assert_eq!(metrics.deduplicated, (reports.len() - seen.len()) as u64);
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
