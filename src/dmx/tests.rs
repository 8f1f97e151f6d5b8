//! Coordination engine integration tests.
//!
//! Clusters run on a [`SimNetwork`] so each test picks the exact
//! cross-channel interleaving it needs, while every channel stays FIFO.

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::checker::{group_records, Checker};
use crate::config::ConfigError;
use crate::net::{MockNetwork, SimEndpoint, SimNetwork};

use super::error::DmxError;
use super::message::{DmxMessage, MAX_WIRE_VALUE};
use super::node::{DmxNode, ProcessState};
use super::peers::MAX_PROCESSES;
use super::store::MemorySnapshotStore;

/// Helper to drive a cluster of nodes over a simulated network.
struct SimCluster {
    net: SimNetwork,
    nodes: Vec<DmxNode<SimEndpoint>>,
    stores: Vec<MemorySnapshotStore>,
}

impl SimCluster {
    fn new(n: u32) -> Self {
        let net = SimNetwork::new(n);
        let stores: Vec<MemorySnapshotStore> = (0..n).map(|_| MemorySnapshotStore::new()).collect();
        let nodes = (0..n)
            .map(|id| {
                DmxNode::with_sink(net.endpoint(id), Box::new(stores[id as usize].clone())).unwrap()
            })
            .collect();
        SimCluster { net, nodes, stores }
    }

    fn node(&self, id: u32) -> &DmxNode<SimEndpoint> {
        &self.nodes[id as usize]
    }

    fn node_mut(&mut self, id: u32) -> &mut DmxNode<SimEndpoint> {
        &mut self.nodes[id as usize]
    }

    /// Deliver the oldest body on one channel. Returns false if it was empty.
    fn deliver(&mut self, from: u32, to: u32) -> bool {
        match self.net.deliver(from, to) {
            Some(d) => {
                self.nodes[d.to as usize].handle_inbound(&d.body);
                true
            }
            None => false,
        }
    }

    /// Drain one channel completely.
    fn deliver_channel(&mut self, from: u32, to: u32) {
        while self.deliver(from, to) {}
    }

    /// Deliver everything, channel by channel in id order, until quiet.
    fn run_until_idle(&mut self) {
        let n = self.nodes.len() as u32;
        while !self.net.is_idle() {
            for from in 0..n {
                for to in 0..n {
                    self.deliver(from, to);
                }
            }
        }
    }

    fn deliver_random(&mut self, rng: &mut StdRng) -> bool {
        match self.net.deliver_random(rng) {
            Some(d) => {
                self.nodes[d.to as usize].handle_inbound(&d.body);
                true
            }
            None => false,
        }
    }

    fn in_access(&self) -> Vec<u32> {
        self.nodes
            .iter()
            .filter(|n| n.process_state() == ProcessState::InAccess)
            .map(|n| n.node_id())
            .collect()
    }
}

/// Test: test_tie_break_by_lower_id
///
/// Verifies the total order on requests:
/// 1. P0 and P1 ENTER before exchanging any message (both at ts 1)
/// 2. P0 is granted first; P1 waits on P0's deferred grant
/// 3. P1 is granted only after P0's EXIT
#[test]
fn test_tie_break_by_lower_id() {
    let mut cluster = SimCluster::new(3);
    cluster.node_mut(0).enter().unwrap();
    cluster.node_mut(1).enter().unwrap();
    assert_eq!(cluster.node(0).request().timestamp, 1);
    assert_eq!(cluster.node(1).request().timestamp, 1);

    cluster.run_until_idle();

    assert_eq!(cluster.in_access(), vec![0]);
    assert_eq!(cluster.node(1).process_state(), ProcessState::WantsAccess);
    assert_eq!(cluster.node(1).responses(), 1);
    assert!(cluster.node(0).waiting().contains(1));

    cluster.node_mut(0).exit().unwrap();
    cluster.run_until_idle();

    assert_eq!(cluster.in_access(), vec![1]);
    assert_eq!(cluster.node(0).grants(), 1);
    assert_eq!(cluster.node(1).grants(), 1);
    assert!(cluster.node(0).waiting().is_empty());
}

/// Test: test_snapshot_records_holder_in_access
///
/// Verifies a snapshot taken while P0 holds access:
/// 1. P0 holds access, P1 waits on P0's deferred grant
/// 2. P2 starts a snapshot; P0 records IN_ACCESS with P1 deferred
/// 3. P0 exits after recording; the grant is not part of the cut
/// 4. The global snapshot completes and passes every invariant
#[test]
fn test_snapshot_records_holder_in_access() {
    let mut cluster = SimCluster::new(3);
    cluster.node_mut(0).enter().unwrap();
    cluster.run_until_idle();
    assert_eq!(cluster.in_access(), vec![0]);

    cluster.node_mut(1).enter().unwrap();
    cluster.run_until_idle();
    assert_eq!(cluster.node(1).responses(), 1);

    let id = cluster.node_mut(2).start_snapshot().unwrap();
    cluster.deliver(2, 0);

    let rec = cluster.node(0).snapshot(id).unwrap().clone();
    assert_eq!(rec.state, ProcessState::InAccess);
    assert!(rec.waiting.contains(1));

    cluster.node_mut(0).exit().unwrap();
    cluster.run_until_idle();
    assert_eq!(cluster.in_access(), vec![1]);

    let records: Vec<_> = cluster.stores.iter().flat_map(|s| s.records()).collect();
    assert_eq!(records.len(), 3);
    let p1 = records.iter().find(|r| r.process_id == 1).unwrap();
    assert_eq!(p1.state, ProcessState::WantsAccess);
    assert!(p1.messages.is_empty());

    let snapshots = group_records(records).unwrap();
    let result = Checker::new().check(&snapshots[0]);
    assert!(result.complete);
    assert!(result.passed, "{:?}", result.violations);
    assert_eq!(result.stats.in_access, 1);
}

/// Test: test_grant_in_flight_is_recorded
///
/// Verifies channel recording:
/// 1. P1 records first (marker from P2) while waiting on P0
/// 2. P0 exits and sends its deferred grant, then records on P2's marker
/// 3. The grant reaches P1 before P0's marker, so P1 records it on channel 0
#[test]
fn test_grant_in_flight_is_recorded() {
    let mut cluster = SimCluster::new(3);
    cluster.node_mut(0).enter().unwrap();
    cluster.run_until_idle();
    cluster.node_mut(1).enter().unwrap();
    cluster.run_until_idle();

    let id = cluster.node_mut(2).start_snapshot().unwrap();
    cluster.deliver(2, 1);
    assert_eq!(
        cluster.node(1).snapshot(id).unwrap().state,
        ProcessState::WantsAccess
    );

    cluster.node_mut(0).exit().unwrap();
    cluster.deliver(2, 0);
    assert_eq!(
        cluster.node(0).snapshot(id).unwrap().state,
        ProcessState::NotInterested
    );

    // Channel 0 -> 1 now holds: respOK, marker
    cluster.deliver_channel(0, 1);
    let rec = cluster.node(1).snapshot(id).unwrap();
    let on_channel_0: Vec<&DmxMessage> = rec.channel_messages(0).collect();
    assert_eq!(on_channel_0.len(), 1);
    assert!(matches!(on_channel_0[0], DmxMessage::RespOk { sender: 0, .. }));
    assert_eq!(cluster.in_access(), vec![1]);

    cluster.run_until_idle();
    let snapshots = group_records(cluster.stores.iter().flat_map(|s| s.records())).unwrap();
    let result = Checker::new().check(&snapshots[0]);
    assert!(result.passed, "{:?}", result.violations);
    assert_eq!(result.stats.in_flight, 1);
}

/// Test: test_node_rejects_unusable_cluster
///
/// Verifies construction fails with a config error, instead of panicking,
/// when the transport's cluster cannot be run.
///
/// 1. Process id outside the cluster
/// 2. Empty cluster
/// 3. More processes than a peer set can hold
#[test]
fn test_node_rejects_unusable_cluster() {
    let net = SimNetwork::new(3);
    assert!(matches!(
        DmxNode::new(net.endpoint(3)),
        Err(DmxError::Config(ConfigError::NodeIdOutOfRange {
            node_id: 3,
            process_count: 3
        }))
    ));

    let empty = SimNetwork::new(0);
    assert!(matches!(
        DmxNode::new(empty.endpoint(0)),
        Err(DmxError::Config(ConfigError::NoProcesses))
    ));

    let large = SimNetwork::new(MAX_PROCESSES + 1);
    assert!(matches!(
        DmxNode::new(large.endpoint(0)),
        Err(DmxError::Config(ConfigError::TooManyProcesses { .. }))
    ));

    let full = SimNetwork::new(MAX_PROCESSES);
    assert!(DmxNode::new(full.endpoint(MAX_PROCESSES - 1)).is_ok());
}

/// Test: test_garbage_is_discarded
///
/// Verifies malformed or foreign bodies leave the node untouched.
#[test]
fn test_garbage_is_discarded() {
    let mut cluster = SimCluster::new(3);
    cluster.node_mut(0).enter().unwrap();
    let before = cluster.node(0).status();
    let sent = cluster.net.sent_count();

    for body in [
        "garbage",
        "",
        "reqEntry:1",
        "reqEntry:1:2:3",
        "respOK:x:4",
        "grant:1:4",
        "reqEntry:9:1",
        "reqEntry:0:5",
        "TAKE_SNAPSHOT:1:-1",
    ] {
        cluster.node_mut(0).handle_inbound(body);
    }

    let after = cluster.node(0).status();
    assert_eq!(after.discarded_messages, 9);
    assert_eq!(after.state, before.state);
    assert_eq!(after.clock, before.clock);
    assert_eq!(after.responses, before.responses);
    assert_eq!(after.active_snapshots, 0);
    assert_eq!(cluster.net.sent_count(), sent);
}

/// Test: test_out_of_range_values_are_discarded
///
/// Verifies timestamps and snapshot ids near the top of the `u64` range are
/// dropped at the boundary instead of overflowing the clock or the next
/// snapshot id.
///
/// 1. Deliver a request and a grant stamped `u64::MAX`
/// 2. Deliver a marker with id `u64::MAX`
/// 3. The clock, snapshot map and highest id are untouched
/// 4. A local snapshot still gets an ordinary id
#[test]
fn test_out_of_range_values_are_discarded() {
    let mut cluster = SimCluster::new(3);
    cluster.node_mut(0).enter().unwrap();
    let before = cluster.node(0).status();

    let max = u64::MAX;
    cluster.node_mut(0).handle_inbound(&format!("reqEntry:1:{}", max));
    cluster.node_mut(0).handle_inbound(&format!("respOK:2:{}", max));
    cluster.node_mut(0).handle_inbound(&format!("TAKE_SNAPSHOT:1:{}", max));

    let after = cluster.node(0).status();
    assert_eq!(after.discarded_messages, 3);
    assert_eq!(after.clock, before.clock);
    assert_eq!(after.responses, 0);
    assert_eq!(cluster.node(0).highest_snapshot_id(), 0);

    let id = cluster.node_mut(0).start_snapshot().unwrap();
    assert_eq!(id, 3);
}

/// Test: test_largest_wire_values_do_not_overflow
///
/// Verifies the largest accepted timestamp and snapshot id leave room for
/// the clock to keep ticking and for a new snapshot id above them.
#[test]
fn test_largest_wire_values_do_not_overflow() {
    let mut cluster = SimCluster::new(3);

    cluster
        .node_mut(0)
        .handle_inbound(&format!("reqEntry:1:{}", MAX_WIRE_VALUE));
    assert_eq!(cluster.node(0).clock(), MAX_WIRE_VALUE + 1);
    cluster.node_mut(0).enter().unwrap();
    assert_eq!(cluster.node(0).request().timestamp, MAX_WIRE_VALUE + 2);

    cluster
        .node_mut(0)
        .handle_inbound(&format!("TAKE_SNAPSHOT:1:{}", MAX_WIRE_VALUE));
    assert_eq!(cluster.node(0).highest_snapshot_id(), MAX_WIRE_VALUE);
    let id = cluster.node_mut(0).start_snapshot().unwrap();
    assert!(id > MAX_WIRE_VALUE);
    assert_eq!(id % 3, 0);
}

/// Test: test_deferred_grant_sent_once_on_exit
///
/// Verifies a deferred peer gets exactly one grant, and only on EXIT.
#[test]
fn test_deferred_grant_sent_once_on_exit() {
    let mut cluster = SimCluster::new(2);
    cluster.node_mut(0).enter().unwrap();
    cluster.run_until_idle();
    cluster.node_mut(1).enter().unwrap();
    cluster.deliver_channel(1, 0);

    assert!(cluster.net.peek_channel(0, 1).is_empty());

    cluster.node_mut(0).exit().unwrap();
    let grants: Vec<String> = cluster.net.peek_channel(0, 1);
    assert_eq!(grants.len(), 1);
    assert!(grants[0].starts_with("respOK:0:"));

    cluster.run_until_idle();
    assert_eq!(cluster.in_access(), vec![1]);
    assert!(cluster.node(0).waiting().is_empty());
}

/// Test: test_duplicate_marker_in_cluster
///
/// Verifies a repeated marker neither re-captures state nor duplicates
/// recorded messages or persisted records.
#[test]
fn test_duplicate_marker_in_cluster() {
    let mut cluster = SimCluster::new(3);
    let id = cluster.node_mut(0).start_snapshot().unwrap();
    cluster.deliver(0, 1);

    // Ordinary traffic on the still-open channel 2 -> 1
    cluster.node_mut(2).enter().unwrap();
    cluster.deliver(2, 1);
    let recorded = cluster.node(1).snapshot(id).unwrap().messages.len();
    assert_eq!(recorded, 1);

    cluster.net.inject(0, 1, &format!("TAKE_SNAPSHOT:0:{}", id));
    cluster.deliver(0, 1);
    let rec = cluster.node(1).snapshot(id).unwrap();
    assert_eq!(rec.messages.len(), 1);
    assert_eq!(rec.closed.count(), 2);

    cluster.run_until_idle();
    for store in &cluster.stores {
        assert_eq!(store.len(), 1);
    }
}

/// Test: test_concurrent_snapshots
///
/// Verifies two initiators running snapshots at the same time, interleaved
/// with mutual-exclusion traffic, produce independent consistent cuts.
#[test]
fn test_concurrent_snapshots() {
    let mut cluster = SimCluster::new(3);
    let mut rng = StdRng::seed_from_u64(42);

    cluster.node_mut(1).enter().unwrap();
    cluster.node_mut(2).enter().unwrap();
    let a = cluster.node_mut(0).start_snapshot().unwrap();
    let b = cluster.node_mut(2).start_snapshot().unwrap();
    assert_ne!(a, b);

    while cluster.deliver_random(&mut rng) {
        for id in cluster.in_access() {
            cluster.node_mut(id).exit().unwrap();
        }
    }

    for store in &cluster.stores {
        assert_eq!(store.len(), 2);
    }
    let snapshots = group_records(cluster.stores.iter().flat_map(|s| s.records())).unwrap();
    assert_eq!(snapshots.len(), 2);
    for result in Checker::new().check_all(&snapshots) {
        assert!(result.complete);
        assert!(result.passed, "{:?}", result.violations);
    }
}

/// Test: test_mock_network_round_trip
///
/// Verifies the engine over the in-process channel network, driven with
/// `process_all` the way a single-threaded host would.
#[test]
fn test_mock_network_round_trip() {
    let mut network = MockNetwork::new(3);
    let mut nodes: Vec<_> = (0..3)
        .map(|id| DmxNode::new(network.create_endpoint(id).unwrap()).unwrap())
        .collect();

    for round in 0..3 {
        for node in nodes.iter_mut() {
            node.enter().unwrap();
        }
        let mut served = Vec::new();
        while served.len() < 3 {
            let mut progress = 0;
            for node in nodes.iter_mut() {
                progress += node.process_all();
            }
            let holders: Vec<usize> = nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.process_state() == ProcessState::InAccess)
                .map(|(i, _)| i)
                .collect();
            assert!(holders.len() <= 1, "round {}: holders {:?}", round, holders);
            if let Some(&holder) = holders.first() {
                served.push(holder);
                nodes[holder].exit().unwrap();
            } else {
                assert!(progress > 0, "round {}: stalled", round);
            }
        }
        // All requested together: served in (timestamp, id) order
        let mut order = served.clone();
        order.sort_by_key(|&i| nodes[i].request());
        assert_eq!(served, order);
    }
}

struct ScheduleOutcome {
    grants: Vec<u64>,
    snapshots: usize,
}

/// Run `rounds` accesses per process under a random schedule, checking the
/// safety, fairness and clock properties after every step.
fn run_schedule(seed: u64, n: u32, rounds: u32) -> Result<ScheduleOutcome, TestCaseError> {
    const MAX_STEPS: usize = 50_000;
    const MAX_SNAPSHOTS: usize = 3;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut cluster = SimCluster::new(n);
    let mut remaining = vec![rounds; n as usize];
    let mut clocks = vec![0u64; n as usize];
    let mut snapshots = 0;

    for _ in 0..MAX_STEPS {
        if rng.gen_bool(0.6) && !cluster.net.is_idle() {
            cluster.deliver_random(&mut rng);
        } else {
            let id = rng.gen_range(0..n);
            if snapshots < MAX_SNAPSHOTS && rng.gen_bool(0.05) {
                cluster.node_mut(id).start_snapshot().unwrap();
                snapshots += 1;
            }
            match cluster.node(id).process_state() {
                ProcessState::NotInterested if remaining[id as usize] > 0 => {
                    let before = cluster.node(id).clock();
                    cluster.node_mut(id).enter().unwrap();
                    prop_assert!(cluster.node(id).clock() > before);
                    remaining[id as usize] -= 1;
                }
                ProcessState::InAccess => cluster.node_mut(id).exit().unwrap(),
                _ => {}
            }
        }

        let holders = cluster.in_access();
        prop_assert!(holders.len() <= 1, "holders {:?}", holders);

        // Nobody wanting with an earlier request may be overtaken.
        if let Some(&holder) = holders.first() {
            let held = cluster.node(holder).request();
            for other in &cluster.nodes {
                if other.process_state() == ProcessState::WantsAccess {
                    prop_assert!(
                        held.precedes(&other.request()),
                        "{:?} holds ahead of {:?}",
                        held,
                        other.request()
                    );
                }
            }
        }

        for node in &cluster.nodes {
            let i = node.node_id() as usize;
            prop_assert!(node.clock() >= clocks[i]);
            clocks[i] = node.clock();
        }

        let done = remaining.iter().all(|&r| r == 0)
            && cluster
                .nodes
                .iter()
                .all(|n| n.process_state() == ProcessState::NotInterested)
            && cluster.net.is_idle();
        if done {
            break;
        }
    }

    prop_assert!(cluster.net.is_idle(), "schedule did not settle");
    for node in &cluster.nodes {
        prop_assert_eq!(node.process_state(), ProcessState::NotInterested);
        prop_assert!(!node.is_snapshot_active());
        prop_assert_eq!(node.discarded(), 0);
    }

    let records = cluster.stores.iter().flat_map(|s| s.records());
    let global = group_records(records).map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert_eq!(global.len(), snapshots);
    for result in Checker::new().check_all(&global) {
        prop_assert!(result.complete);
        prop_assert!(result.passed, "{:?}", result.violations);
    }

    Ok(ScheduleOutcome {
        grants: cluster.nodes.iter().map(|n| n.grants()).collect(),
        snapshots,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every schedule is safe, fair and live, and every snapshot is a
    /// consistent cut.
    #[test]
    fn prop_random_schedules(seed in any::<u64>(), n in 1u32..=4, rounds in 1u32..=3) {
        let outcome = run_schedule(seed, n, rounds)?;
        prop_assert!(outcome.grants.iter().all(|&g| g == rounds as u64));
        prop_assert!(outcome.snapshots <= 3);
    }
}
