// tests/integration/recovery_test.rs

//! UNPREPARED recovery: a coordinator that lost a prepared statement gets a
//! PREPARE on the same connection and the original EXECUTE is replayed,
//! all invisible to the caller.

use super::fixtures::{MockNode, MockState, init_tracing};
use bytes::Bytes;
use lazulite::config::Config;
use lazulite::core::Cluster;
use lazulite::core::execution::{BoundStatement, QueryOptions};
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_unprepared_bounce_is_recovered_on_the_same_host() {
    init_tracing();
    let node = MockNode::start(MockState::new("dc1", "r1", "0")).await;
    let cluster = Cluster::new(Config {
        contact_points: vec![node.addr.to_string()],
        port: node.addr.port(),
        ..Default::default()
    })
    .unwrap();
    let session = cluster.connect().await.unwrap();

    let prepared = session
        .prepare("INSERT INTO ks.t (k, v) VALUES (?, ?)")
        .await
        .unwrap();
    assert_eq!(prepared.id.as_ref(), &[0x0B, 0x0B, 0x0B, 0x0B][..]);
    assert_eq!(prepared.pk_indices, vec![0]);
    assert_eq!(session.prepared_statements().len(), 1);

    let prepares_before = node.state.counters.prepare.load(Ordering::Relaxed);

    // Prime the node to forget the statement once.
    node.state.unprepared_once.store(true, Ordering::Release);

    let bound = BoundStatement::new(
        prepared,
        vec![Some(Bytes::from_static(b"\x00\x00\x00\x2A")), None],
    );
    let result = session.execute(bound, QueryOptions::default()).await.unwrap();

    // The caller sees a single successful result.
    assert_eq!(result.row_count(), 1);

    // Underneath: two EXECUTEs around one recovery PREPARE.
    assert_eq!(node.state.counters.execute.load(Ordering::Relaxed), 2);
    assert_eq!(
        node.state.counters.prepare.load(Ordering::Relaxed),
        prepares_before + 1
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_execute_without_priming_takes_one_round_trip() {
    init_tracing();
    let node = MockNode::start(MockState::new("dc1", "r1", "0")).await;
    let cluster = Cluster::new(Config {
        contact_points: vec![node.addr.to_string()],
        port: node.addr.port(),
        ..Default::default()
    })
    .unwrap();
    let session = cluster.connect().await.unwrap();

    let prepared = session.prepare("SELECT v FROM ks.t WHERE k = ?").await.unwrap();
    let bound = BoundStatement::new(prepared, vec![Some(Bytes::from_static(b"\x00\x00\x00\x01"))]);
    let result = session.execute(bound, QueryOptions::default()).await.unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(node.state.counters.execute.load(Ordering::Relaxed), 1);

    cluster.shutdown().await;
}
