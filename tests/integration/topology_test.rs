// tests/integration/topology_test.rs

//! Topology events: a NEW_NODE push must surface the host in metadata and
//! grow a pool to it within the debounce window.

use super::fixtures::{MockNode, MockState, init_tracing};
use lazulite::config::Config;
use lazulite::core::Cluster;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_new_node_event_adds_host_and_pool() {
    init_tracing();
    let node1 = MockNode::start(MockState::new("dc1", "r1", "-1000000")).await;
    let node2 = MockNode::start(MockState::new("dc1", "r2", "0")).await;
    node1.state.peers.lock().unwrap().push(node2.as_peer());

    let cluster = Cluster::new(Config {
        contact_points: vec![node1.addr.to_string()],
        port: node1.addr.port(),
        ..Default::default()
    })
    .unwrap();
    let _session = cluster.connect().await.unwrap();
    assert_eq!(cluster.metadata().snapshot().hosts.len(), 2);
    let revision_before = cluster.metadata().revision();

    // A new participant appears: register it in the peers table, then
    // push the event the way a real cluster would.
    let node3 = MockNode::start(MockState::new("dc1", "r3", "1000000")).await;
    node1.state.peers.lock().unwrap().push(node3.as_peer());
    node1.send_new_node_event(node3.addr);

    // Within the debounce window (1s) plus a margin the host must be
    // known, the revision advanced, and its pool connected.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = cluster.metadata().snapshot();
        let pool_ready = cluster
            .pool_connection_counts()
            .get(&node3.state.host_id)
            .is_some_and(|&count| count >= 1);
        if snapshot.hosts.contains_key(&node3.state.host_id) && pool_ready {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "new node did not materialize in time: hosts={}, pools={:?}",
            snapshot.hosts.len(),
            cluster.pool_connection_counts()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(cluster.metadata().revision() > revision_before);
    assert!(node3.state.counters.startup.load(Ordering::Relaxed) >= 1);

    cluster.shutdown().await;
}
