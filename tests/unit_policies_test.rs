use lazulite::core::DriverError;
use lazulite::core::policies::{
    ConstantReconnection, ConstantSpeculativeExecution, DefaultLoadBalancing, DefaultRetryPolicy,
    ExponentialReconnection, FallthroughRetryPolicy, FixedMapTranslator, IdentityTranslator,
    LoadBalancingPolicy, MonotonicTimestampGenerator, NoSpeculativeExecution, AddressTranslator,
    ReconnectionPolicy, ReconnectionSchedule as _, RetryDecision, RetryPolicy, RoutingInfo,
    SpeculativeExecutionPolicy, TimestampGenerator,
};
use lazulite::core::protocol::Consistency;
use lazulite::core::topology::ring::{KeyspaceInfo, ReplicationStrategy};
use lazulite::core::topology::{Host, HostDistance, HostState, MetadataSnapshot, TokenRing};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn host(port: u16, dc: &str, tokens: Vec<i64>, state: HostState) -> Arc<Host> {
    Arc::new(Host {
        id: Uuid::new_v4(),
        address: format!("127.0.0.1:{port}").parse().unwrap(),
        broadcast_address: None,
        datacenter: Some(dc.to_string()),
        rack: Some("r1".to_string()),
        release_version: None,
        tokens,
        state,
    })
}

fn snapshot_of(hosts: Vec<Arc<Host>>) -> MetadataSnapshot {
    let hosts: HashMap<Uuid, Arc<Host>> = hosts.into_iter().map(|h| (h.id, h)).collect();
    let ring = TokenRing::build(&hosts);
    let mut keyspaces = indexmap::IndexMap::new();
    keyspaces.insert(
        "ks".to_string(),
        KeyspaceInfo {
            name: "ks".to_string(),
            strategy: ReplicationStrategy::Simple {
                replication_factor: 2,
            },
            durable_writes: true,
        },
    );
    MetadataSnapshot {
        revision: 1,
        cluster_name: Some("test".to_string()),
        hosts,
        keyspaces,
        ring,
    }
}

// --- Load balancing ---

#[test]
fn test_query_plan_yields_each_host_at_most_once_and_is_terminal() {
    let policy = DefaultLoadBalancing::new();
    let snapshot = snapshot_of(vec![
        host(9042, "dc1", vec![0], HostState::Up),
        host(9043, "dc1", vec![100], HostState::Up),
        host(9044, "dc1", vec![200], HostState::Up),
    ]);
    policy.initialize(&snapshot);
    let mut plan = policy.new_query_plan(&RoutingInfo::default(), &snapshot);
    let mut seen = HashSet::new();
    for h in plan.by_ref() {
        assert!(seen.insert(h.id), "host {} appeared twice in a plan", h.id);
    }
    assert_eq!(seen.len(), 3);
    // Exhaustion is terminal.
    assert!(plan.next().is_none());
    assert!(plan.next().is_none());
}

#[test]
fn test_query_plan_excludes_down_hosts() {
    let down = host(9042, "dc1", vec![0], HostState::Down);
    let up = host(9043, "dc1", vec![100], HostState::Up);
    let down_id = down.id;
    let policy = DefaultLoadBalancing::new();
    let snapshot = snapshot_of(vec![down, up]);
    policy.initialize(&snapshot);
    let plan = policy.new_query_plan(&RoutingInfo::default(), &snapshot);
    let planned: Vec<Uuid> = plan.map(|h| h.id).collect();
    assert_eq!(planned.len(), 1);
    assert!(!planned.contains(&down_id));
}

#[test]
fn test_token_aware_plan_puts_replicas_first() {
    let h1 = host(9042, "dc1", vec![-1000], HostState::Up);
    let h2 = host(9043, "dc1", vec![0], HostState::Up);
    let h3 = host(9044, "dc1", vec![1000], HostState::Up);
    let (h2_id, h3_id) = (h2.id, h3.id);
    let policy = DefaultLoadBalancing::new();
    let snapshot = snapshot_of(vec![h1, h2, h3]);
    policy.initialize(&snapshot);

    // Token -500 lands on the owner of token 0; rf=2 adds the next host.
    let routing = RoutingInfo {
        keyspace: Some("ks"),
        token: Some(-500),
    };
    let planned: Vec<Uuid> = policy
        .new_query_plan(&routing, &snapshot)
        .map(|h| h.id)
        .collect();
    assert_eq!(planned.len(), 3);
    assert_eq!(planned[0], h2_id, "primary replica must lead the plan");
    assert_eq!(planned[1], h3_id, "second replica must follow");
}

#[test]
fn test_remote_dc_hosts_trail_the_plan() {
    let local = host(9042, "dc1", vec![0], HostState::Up);
    let remote = host(9043, "dc2", vec![100], HostState::Up);
    let (local_id, remote_id) = (local.id, remote.id);
    let policy = DefaultLoadBalancing::with_local_dc("dc1");
    let snapshot = snapshot_of(vec![local, remote]);
    policy.initialize(&snapshot);

    for _ in 0..4 {
        let planned: Vec<Uuid> = policy
            .new_query_plan(&RoutingInfo::default(), &snapshot)
            .map(|h| h.id)
            .collect();
        assert_eq!(planned, vec![local_id, remote_id]);
    }
}

#[test]
fn test_distance_follows_local_dc() {
    let local = host(9042, "dc1", vec![0], HostState::Up);
    let remote = host(9043, "dc2", vec![100], HostState::Up);
    let policy = DefaultLoadBalancing::with_local_dc("dc1");
    assert_eq!(policy.distance(&local), HostDistance::Local);
    assert_eq!(policy.distance(&remote), HostDistance::Remote);
}

#[test]
fn test_local_dc_inferred_from_first_snapshot() {
    let policy = DefaultLoadBalancing::new();
    let snapshot = snapshot_of(vec![host(9042, "dc9", vec![0], HostState::Up)]);
    policy.initialize(&snapshot);
    let other_dc = host(9043, "dc1", vec![100], HostState::Up);
    assert_eq!(policy.distance(&other_dc), HostDistance::Remote);
}

// --- Retry ---

#[test]
fn test_default_retry_read_timeout_rules() {
    let policy = DefaultRetryPolicy;
    let enough_replicas_no_data = DriverError::ReadTimeout {
        consistency: Consistency::Quorum,
        received: 2,
        block_for: 2,
        data_present: false,
    };
    assert_eq!(
        policy.on_error(&enough_replicas_no_data, false, 0),
        RetryDecision::RetrySame
    );
    assert_eq!(
        policy.on_error(&enough_replicas_no_data, false, 1),
        RetryDecision::Rethrow
    );

    let data_present = DriverError::ReadTimeout {
        consistency: Consistency::Quorum,
        received: 2,
        block_for: 2,
        data_present: true,
    };
    assert_eq!(policy.on_error(&data_present, true, 0), RetryDecision::Rethrow);
}

#[test]
fn test_default_retry_write_timeout_only_batch_log_idempotent() {
    let policy = DefaultRetryPolicy;
    let batch_log = DriverError::WriteTimeout {
        consistency: Consistency::Quorum,
        received: 1,
        block_for: 2,
        write_type: "BATCH_LOG".to_string(),
    };
    assert_eq!(policy.on_error(&batch_log, true, 0), RetryDecision::RetrySame);
    assert_eq!(policy.on_error(&batch_log, false, 0), RetryDecision::Rethrow);

    let simple = DriverError::WriteTimeout {
        consistency: Consistency::Quorum,
        received: 1,
        block_for: 2,
        write_type: "SIMPLE".to_string(),
    };
    assert_eq!(policy.on_error(&simple, true, 0), RetryDecision::Rethrow);
}

#[test]
fn test_default_retry_unavailable_tries_next_host_once() {
    let policy = DefaultRetryPolicy;
    let unavailable = DriverError::Unavailable {
        consistency: Consistency::Quorum,
        required: 2,
        alive: 1,
    };
    assert_eq!(policy.on_error(&unavailable, false, 0), RetryDecision::RetryNext);
    assert_eq!(policy.on_error(&unavailable, false, 1), RetryDecision::Rethrow);
}

#[test]
fn test_default_retry_transport_errors_respect_idempotence() {
    let policy = DefaultRetryPolicy;
    let closed = DriverError::ConnectionClosed("reset by peer".to_string());
    assert_eq!(policy.on_error(&closed, true, 0), RetryDecision::RetryNext);
    // A consumed non-idempotent write must never be replayed.
    assert_eq!(policy.on_error(&closed, false, 0), RetryDecision::Rethrow);

    let timed_out = DriverError::OperationTimedOut("attempt deadline".to_string());
    assert_eq!(policy.on_error(&timed_out, true, 0), RetryDecision::RetryNext);
    assert_eq!(policy.on_error(&timed_out, false, 0), RetryDecision::Rethrow);
}

#[test]
fn test_default_retry_rethrows_query_errors() {
    let policy = DefaultRetryPolicy;
    assert_eq!(
        policy.on_error(&DriverError::SyntaxError("bad".into()), true, 0),
        RetryDecision::Rethrow
    );
    assert_eq!(
        policy.on_error(&DriverError::InvalidQuery("bad".into()), true, 0),
        RetryDecision::Rethrow
    );
}

#[test]
fn test_fallthrough_policy_never_retries() {
    let policy = FallthroughRetryPolicy;
    let closed = DriverError::ConnectionClosed("reset".to_string());
    assert_eq!(policy.on_error(&closed, true, 0), RetryDecision::Rethrow);
}

// --- Speculative execution ---

#[test]
fn test_no_speculative_execution() {
    assert_eq!(NoSpeculativeExecution.next_execution(1), None);
}

#[test]
fn test_constant_speculative_execution_counts_down() {
    let policy = ConstantSpeculativeExecution::new(Duration::from_millis(100), 3);
    assert_eq!(policy.next_execution(1), Some(Duration::from_millis(100)));
    assert_eq!(policy.next_execution(2), Some(Duration::from_millis(100)));
    assert_eq!(policy.next_execution(3), None);
}

// --- Reconnection ---

#[test]
fn test_exponential_schedule_grows_and_caps() {
    let policy = ExponentialReconnection::new(Duration::from_secs(1), Duration::from_secs(600));
    let mut schedule = policy.new_schedule();
    let mut previous = Duration::ZERO;
    for _ in 0..12 {
        let delay = schedule.next_delay();
        assert!(delay <= Duration::from_secs(600));
        // Jitter aside, the sequence trends upward until the cap.
        assert!(delay >= previous.mul_f64(0.4));
        previous = delay;
    }
    // Far in the schedule the cap dominates.
    for _ in 0..30 {
        let _ = schedule.next_delay();
    }
    assert!(schedule.next_delay() <= Duration::from_secs(600));
}

#[test]
fn test_first_exponential_delay_is_near_base() {
    let policy = ExponentialReconnection::new(Duration::from_secs(1), Duration::from_secs(600));
    let first = policy.new_schedule().next_delay();
    assert!(first >= Duration::from_millis(850));
    assert!(first <= Duration::from_millis(1150));
}

#[test]
fn test_constant_schedule_is_flat() {
    let policy = ConstantReconnection {
        delay: Duration::from_millis(250),
    };
    let mut schedule = policy.new_schedule();
    assert_eq!(schedule.next_delay(), Duration::from_millis(250));
    assert_eq!(schedule.next_delay(), Duration::from_millis(250));
}

// --- Address translation ---

#[test]
fn test_identity_translator() {
    let addr = "10.0.0.1:9042".parse().unwrap();
    assert_eq!(IdentityTranslator.translate(addr), addr);
}

#[test]
fn test_fixed_map_translator() {
    let internal = "10.0.0.1:9042".parse().unwrap();
    let external = "203.0.113.5:19042".parse().unwrap();
    let translator = FixedMapTranslator::new(HashMap::from([(internal, external)]));
    assert_eq!(translator.translate(internal), external);
    let unmapped = "10.0.0.2:9042".parse().unwrap();
    assert_eq!(translator.translate(unmapped), unmapped);
}

// --- Timestamps ---

#[test]
fn test_timestamps_are_strictly_monotonic() {
    let generator = MonotonicTimestampGenerator::new();
    let mut last = generator.next();
    for _ in 0..10_000 {
        let next = generator.next();
        assert!(next > last, "timestamps must strictly increase");
        last = next;
    }
}

#[test]
fn test_timestamps_monotonic_across_threads() {
    let generator = Arc::new(MonotonicTimestampGenerator::new());
    let mut handles = Vec::new();
    for _ in 0..4 {
        let generator = generator.clone();
        handles.push(std::thread::spawn(move || {
            let mut out = Vec::with_capacity(1_000);
            for _ in 0..1_000 {
                out.push(generator.next());
            }
            out
        }));
    }
    let mut all: Vec<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let count = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), count, "no timestamp may repeat across threads");
}
