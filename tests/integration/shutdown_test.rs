// tests/integration/shutdown_test.rs

//! Shutdown semantics: pending work fails as "cluster closing", shutdown is
//! idempotent, and a disposed cluster rejects further use.

use super::fixtures::{MockNode, MockState, init_tracing};
use lazulite::config::Config;
use lazulite::core::{Cluster, DriverError};
use std::time::Duration;

#[tokio::test]
async fn test_shutdown_fails_pending_queries_and_disposes_the_handle() {
    init_tracing();
    let node = MockNode::start(MockState::new("dc1", "r1", "0")).await;
    let cluster = Cluster::new(Config {
        contact_points: vec![node.addr.to_string()],
        port: node.addr.port(),
        ..Default::default()
    })
    .unwrap();

    // Several sessions over the same runtime.
    let mut sessions = Vec::new();
    for _ in 0..5 {
        sessions.push(cluster.connect().await.unwrap());
    }
    assert_eq!(sessions[0].name(), "session1");
    assert_eq!(sessions[4].name(), "session5");
    assert_ne!(sessions[0].id(), sessions[1].id());

    // Park a query on a slow node, then pull the plug.
    *node.state.query_delay.lock().unwrap() = Some(Duration::from_secs(5));
    let session = sessions.pop().unwrap();
    let pending = tokio::spawn(async move { session.query("SELECT v FROM ks.t").await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let shutdown = tokio::time::timeout(Duration::from_secs(1), cluster.shutdown()).await;
    assert!(shutdown.is_ok(), "shutdown must complete within its timeout");

    let outcome = pending.await.unwrap();
    match outcome {
        Err(DriverError::ConnectionClosed(reason)) => {
            assert!(reason.contains("cluster closing"), "got: {reason}")
        }
        Err(DriverError::ClusterClosing) => {}
        other => panic!("pending query should fail as cluster-closing, got {other:?}"),
    }

    // Idempotent: a second shutdown is a no-op.
    cluster.shutdown().await;

    // Subsequent connects and queries are rejected as disposed.
    assert!(matches!(
        cluster.connect().await,
        Err(DriverError::Disposed)
    ));
    let leftover = &sessions[0];
    assert!(matches!(
        leftover.query("SELECT 1").await,
        Err(DriverError::Disposed)
    ));
}
