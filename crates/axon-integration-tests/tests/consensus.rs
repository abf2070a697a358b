//! Pattern consensus spread through ordinary sync.

use std::time::Duration;

use axon_bus::Topic;
use axon_cluster::{ConsensusReached, PatternMetrics};
use axon_integration_tests::TestCluster;

#[tokio::test]
async fn replicated_observations_reach_consensus_everywhere() {
    let cluster = TestCluster::with_nodes(&["a", "b", "c"]).await.unwrap();
    cluster.ready().await.unwrap();
    let (a, b, c) = (cluster.node("a"), cluster.node("b"), cluster.node("c"));
    let announced = c.bus().subscribe(Topic::ConsensusReached).unwrap();

    a.aggregator().report_match(a.node_id(), "spike", None).await.unwrap();
    b.aggregator().report_match(b.node_id(), "spike", None).await.unwrap();
    assert!(a.aggregator().get_consensus_patterns(2).is_empty());

    cluster.sync_all().await.unwrap();
    for node in &cluster.nodes {
        node.aggregator().refresh_from_store().await.unwrap();
    }

    for node in &cluster.nodes {
        let agreed = node.aggregator().get_consensus_patterns(2);
        assert_eq!(agreed.len(), 1, "node {}", node.node_id());
        assert_eq!(agreed[0].pattern_id, "spike");
        assert!(node.aggregator().get_consensus_patterns(3).is_empty());
    }

    let event: ConsensusReached = announced.try_recv().unwrap().payload_as().unwrap();
    assert_eq!(event.pattern_id, "spike");
    assert!(announced.try_recv().is_none());
}

#[tokio::test]
async fn dedup_counters_replicate() {
    let cluster = TestCluster::with_nodes(&["a", "b"]).await.unwrap();
    cluster.ready().await.unwrap();
    let (a, b) = (cluster.node("a"), cluster.node("b"));

    a.aggregator().report_match(a.node_id(), "spike", None).await.unwrap();
    a.aggregator().report_match(a.node_id(), "spike", None).await.unwrap();
    b.aggregator().report_match(b.node_id(), "drift", None).await.unwrap();
    cluster.sync_all().await.unwrap();

    let expected = PatternMetrics {
        indexed: 2,
        deduplicated: 1,
    };
    assert_eq!(a.aggregator().pattern_metrics().await.unwrap(), expected);
    assert_eq!(b.aggregator().pattern_metrics().await.unwrap(), expected);
}

#[tokio::test]
async fn background_loops_pick_up_remote_observations() {
    let mut cluster = TestCluster::with_nodes(&["a", "b"]).await.unwrap();
    cluster.ready().await.unwrap();
    for node in cluster.nodes.iter_mut() {
        node.spawn_background().unwrap();
    }
    let (a, b) = (cluster.node("a"), cluster.node("b"));

    a.aggregator().report_match(a.node_id(), "spike", None).await.unwrap();
    a.monitor().sync_with_peers().await.unwrap();

    let learned = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if b.aggregator().record("spike").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(learned.is_ok());
}

#[tokio::test]
async fn cluster_search_skips_an_unreachable_index() {
    let cluster = TestCluster::with_nodes(&["a", "b", "c"]).await.unwrap();
    cluster.ready().await.unwrap();
    let (a, b, c) = (cluster.node("a"), cluster.node("b"), cluster.node("c"));

    cluster.search.insert(a.node_id(), "p1", vec![1.0, 0.0]);
    cluster.search.insert(b.node_id(), "p2", vec![0.5, 0.0]);
    cluster.search.insert(b.node_id(), "p3", vec![3.0, 0.0]);
    cluster.search.insert(c.node_id(), "p4", vec![0.0, 0.0]);
    cluster.search.set_failing(c.node_id(), true);

    let result = a.aggregator().search_cluster(&[0.0, 0.0], 2).await;
    let ids: Vec<&str> = result.hits.iter().map(|h| h.pattern_id.as_str()).collect();
    assert_eq!(ids, ["p2", "p1"]);
    assert!(result.missing.contains_key(c.node_id()));
    assert_eq!(a.monitor().live_peers().len(), 2);
}
