//! Algedonic signals overtake ordinary traffic.

use axon_bus::{BusConfig, Priority, SignalKind, Topic};
use axon_clock::NodeId;
use axon_integration_tests::TestCluster;
use axon_node::NodeConfig;
use serde_json::json;

#[tokio::test]
async fn pain_signal_jumps_a_full_queue() {
    let mut cluster = TestCluster::new();
    let config = NodeConfig {
        bus: BusConfig::default().with_subscriber_capacity(4),
        ..NodeConfig::new(NodeId::new("a").unwrap())
    };
    cluster.add(config).await.unwrap();
    let node = cluster.node("a");

    let topic = Topic::custom("telemetry.raw").unwrap();
    let mut subscriber = node.bus().subscribe(topic.clone()).unwrap();
    subscriber.subscribe(Topic::Algedonic).unwrap();

    for i in 0..10 {
        node.bus().publish(topic.clone(), json!({ "seq": i }));
    }
    assert_eq!(subscriber.dropped(), 6);

    assert!(node
        .escalator()
        .signal(SignalKind::Pain, 0.95, "integration")
        .unwrap()
        .is_escalated());
    assert!(!node
        .escalator()
        .signal(SignalKind::Pleasure, 0.1, "integration")
        .unwrap()
        .is_escalated());

    let first = subscriber.recv().await.unwrap();
    assert_eq!(first.topic, Topic::Algedonic);
    assert_eq!(first.priority, Priority::Algedonic);

    let stats = node.escalator().stats();
    assert_eq!((stats.escalated, stats.ordinary), (1, 1));
}
