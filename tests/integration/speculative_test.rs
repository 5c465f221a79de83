// tests/integration/speculative_test.rs

//! Speculative execution: a slow coordinator must not hold an idempotent
//! read hostage when the policy allows a parallel attempt.

use super::fixtures::{MockNode, MockState, init_tracing};
use lazulite::config::Config;
use lazulite::core::Cluster;
use lazulite::core::execution::{QueryOptions, SimpleStatement};
use lazulite::core::policies::{ConstantSpeculativeExecution, Policies};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_speculative_execution_races_a_second_host() {
    init_tracing();
    let node1 = MockNode::start(MockState::new("dc1", "r1", "-1000000")).await;
    let node2 = MockNode::start(MockState::new("dc1", "r2", "1000000")).await;
    node1.state.peers.lock().unwrap().push(node2.as_peer());

    // One node answers instantly, the other sleeps well past the
    // speculative delay. Which one the plan tries first is rotation
    // dependent, so the bound below covers both cases.
    *node1.state.query_delay.lock().unwrap() = Some(Duration::from_millis(500));

    let config = Config {
        contact_points: vec![node1.addr.to_string()],
        port: node1.addr.port(),
        ..Default::default()
    };
    let mut policies = Policies::from_config(&config);
    policies.speculative = Arc::new(ConstantSpeculativeExecution::new(
        Duration::from_millis(100),
        2,
    ));
    let cluster = Cluster::with_policies(config, policies, None).unwrap();
    let session = cluster.connect().await.unwrap();

    let statement = SimpleStatement::new("SELECT v FROM ks.t WHERE k = 42").idempotent(true);
    let started = Instant::now();
    let result = session
        .execute(statement, QueryOptions::default())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.row_count(), 1);
    // Slow-first: ~100ms (speculative fires) ; fast-first: ~0ms. Both are
    // far below the slow node's 500ms.
    assert!(
        elapsed < Duration::from_millis(400),
        "speculative execution should beat the slow host, took {elapsed:?}"
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_non_idempotent_statements_never_speculate() {
    init_tracing();
    let node1 = MockNode::start(MockState::new("dc1", "r1", "-1000000")).await;
    let node2 = MockNode::start(MockState::new("dc1", "r2", "1000000")).await;
    node1.state.peers.lock().unwrap().push(node2.as_peer());
    *node1.state.query_delay.lock().unwrap() = Some(Duration::from_millis(300));
    *node2.state.query_delay.lock().unwrap() = Some(Duration::from_millis(300));

    let config = Config {
        contact_points: vec![node1.addr.to_string()],
        port: node1.addr.port(),
        ..Default::default()
    };
    let mut policies = Policies::from_config(&config);
    policies.speculative = Arc::new(ConstantSpeculativeExecution::new(
        Duration::from_millis(50),
        4,
    ));
    let cluster = Cluster::with_policies(config, policies, None).unwrap();
    let session = cluster.connect().await.unwrap();

    let before =
        node1.state.counters.query.load(std::sync::atomic::Ordering::Relaxed)
            + node2.state.counters.query.load(std::sync::atomic::Ordering::Relaxed);

    // Not marked idempotent: exactly one attempt despite the slow answer.
    let statement = SimpleStatement::new("INSERT INTO ks.t (k) VALUES (1)");
    let result = session
        .execute(statement, QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);

    let after =
        node1.state.counters.query.load(std::sync::atomic::Ordering::Relaxed)
            + node2.state.counters.query.load(std::sync::atomic::Ordering::Relaxed);
    assert_eq!(after - before, 1, "exactly one network attempt was expected");

    cluster.shutdown().await;
}
