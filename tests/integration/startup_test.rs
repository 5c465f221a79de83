// tests/integration/startup_test.rs

//! Bootstrap against a three-node mock cluster: contact-point handshake,
//! initial refresh, pool creation, and query dispatch.

use super::fixtures::{MockNode, MockState, init_tracing};
use lazulite::config::Config;
use lazulite::core::Cluster;
use std::sync::atomic::Ordering;
use std::time::Duration;

async fn three_node_cluster() -> (MockNode, MockNode, MockNode) {
    let node1 = MockNode::start(MockState::new("dc1", "r1", "-3000000000000000000")).await;
    let node2 = MockNode::start(MockState::new("dc1", "r2", "0")).await;
    let node3 = MockNode::start(MockState::new("dc1", "r3", "3000000000000000000")).await;
    {
        let mut peers = node1.state.peers.lock().unwrap();
        peers.push(node2.as_peer());
        peers.push(node3.as_peer());
    }
    (node1, node2, node3)
}

fn config_for(node: &MockNode) -> Config {
    Config {
        contact_points: vec![node.addr.to_string()],
        port: node.addr.port(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_connect_discovers_all_hosts() {
    init_tracing();
    let (node1, node2, node3) = three_node_cluster().await;
    let cluster = Cluster::new(config_for(&node1)).unwrap();
    let session = cluster.connect().await.unwrap();

    let snapshot = cluster.metadata().snapshot();
    assert_eq!(snapshot.hosts.len(), 3);
    assert_eq!(snapshot.cluster_name.as_deref(), Some("mock-cluster"));

    // Host ids are distinct and match what the nodes advertised.
    let mut ids: Vec<_> = snapshot.hosts.keys().copied().collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    for node in [&node1, &node2, &node3] {
        assert!(snapshot.hosts.contains_key(&node.state.host_id));
    }

    // The session starts with no default keyspace.
    assert_eq!(session.keyspace(), None);

    // The keyspace snapshot came from system_schema.keyspaces.
    assert!(snapshot.keyspace("ks").is_some());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_each_contacted_node_sees_one_handshake_per_connection() {
    init_tracing();
    let (node1, node2, node3) = three_node_cluster().await;
    let cluster = Cluster::new(config_for(&node1)).unwrap();
    let _session = cluster.connect().await.unwrap();

    // Pools reach their core size shortly after connect.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let counts = cluster.pool_connection_counts();
        if counts.len() == 3 && counts.values().all(|&c| c >= 1) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pools did not fill in time: {counts:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Only the control connection REGISTERs for events.
    assert_eq!(node1.state.counters.register.load(Ordering::Relaxed), 1);
    assert_eq!(node2.state.counters.register.load(Ordering::Relaxed), 0);
    assert_eq!(node3.state.counters.register.load(Ordering::Relaxed), 0);

    // Every node contact ran the OPTIONS/STARTUP sequence.
    for node in [&node1, &node2, &node3] {
        assert!(node.state.counters.options.load(Ordering::Relaxed) >= 1);
        assert!(node.state.counters.startup.load(Ordering::Relaxed) >= 1);
        assert_eq!(
            node.state.counters.options.load(Ordering::Relaxed),
            node.state.counters.startup.load(Ordering::Relaxed),
            "one STARTUP per OPTIONS handshake"
        );
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_queries_round_trip_against_the_cluster() {
    init_tracing();
    let (node1, _node2, _node3) = three_node_cluster().await;
    let cluster = Cluster::new(config_for(&node1)).unwrap();
    let session = cluster.connect().await.unwrap();

    let result = session.query("SELECT v FROM ks.t WHERE k = 1").await.unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(result.first_row().unwrap()[0].as_deref(), Some(&b"ok"[..]));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_idle_connections_emit_heartbeats() {
    init_tracing();
    let node = MockNode::start(MockState::new("dc1", "r1", "0")).await;
    let mut config = config_for(&node);
    config.pooling.heartbeat_interval = Duration::from_millis(200);
    let cluster = Cluster::new(config).unwrap();
    let _session = cluster.connect().await.unwrap();

    let baseline = node.state.counters.options.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(900)).await;
    let after = node.state.counters.options.load(Ordering::Relaxed);
    assert!(
        after > baseline,
        "idle connections should probe with OPTIONS ({baseline} -> {after})"
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_use_statement_rebinds_the_session_keyspace() {
    init_tracing();
    let (node1, _node2, _node3) = three_node_cluster().await;
    let cluster = Cluster::new(config_for(&node1)).unwrap();
    let session = cluster.connect().await.unwrap();

    let result = session.query("USE \"ks\"").await.unwrap();
    assert_eq!(result.keyspace.as_deref(), Some("ks"));
    assert_eq!(session.keyspace().as_deref(), Some("ks"));

    cluster.shutdown().await;
}
