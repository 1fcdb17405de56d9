//! End-to-end control-plane scenarios.
//!
//! Several management servers are simulated by separate components sharing
//! one in-memory store, the same way separate processes share one database.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use fleet_agent::SimulatedDriver;
use fleet_cluster::{MembershipManager, OwnershipPartitioner};
use fleet_state::*;
use fleet_vm::{PowerReport, VmCoordinator};

const NOW: u64 = 1_000_000;

fn test_store() -> StateStore {
    StateStore::open_in_memory().unwrap()
}

fn new_host(guid: &str, cluster_id: ClusterId) -> NewHost {
    NewHost {
        guid: guid.to_string(),
        name: guid.to_string(),
        host_type: HostType::Routing,
        hypervisor: "kvm".to_string(),
        private_ip: None,
        cluster_id,
    }
}

/// Fire `event` on the current row as `msid`, asserting it commits.
fn fire(state: &StateStore, host_id: HostId, event: HostEvent, msid: Msid, now: u64) -> Host {
    let host = state.require_host(host_id).unwrap();
    let ctx = HostTransitionContext::new(msid, now);
    assert!(host_status_machine().transit(&host, event, &ctx, state).unwrap());
    state.require_host(host_id).unwrap()
}

/// A host that is Up, enabled and owned by `msid`.
fn up_host(state: &StateStore, cluster_id: ClusterId, guid: &str, msid: Msid, now: u64) -> Host {
    let host = state.create_host(new_host(guid, cluster_id), 0).unwrap();
    resource_state_machine()
        .transit(&host, ResourceEvent::InternalCreated, &(), state)
        .unwrap();
    fire(state, host.id, HostEvent::AgentConnected, msid, now);
    fire(state, host.id, HostEvent::Ready, msid, now)
}

fn partitioner(state: &StateStore, msid: Msid, now: u64) -> OwnershipPartitioner {
    let membership = MembershipManager::new(state.clone(), msid, format!("ms-{msid}"))
        .with_peer_timeout(Duration::from_secs(30));
    membership.join(now).unwrap();
    OwnershipPartitioner::new(state.clone(), Arc::new(membership))
        .with_liveness_timeout(Duration::from_secs(60))
        .with_batch_limit(50)
        .with_ms_down_pushback(Duration::from_secs(600))
}

#[test]
fn ping_from_owner_bumps_version_and_refreshes_liveness() {
    let state = test_store();
    let c = state.create_cluster("c", ManagedState::Managed, 0).unwrap().id;
    let host = up_host(&state, c, "h", 5, NOW - 30);
    let host = fire(&state, host.id, HostEvent::Ping, 5, NOW - 20);
    assert_eq!((host.status, host.management_server_id, host.updated), (Status::Up, Some(5), 3));

    let ctx = HostTransitionContext::new(5, NOW);
    assert!(host_status_machine().transit(&host, HostEvent::Ping, &ctx, &state).unwrap());

    let after = state.require_host(host.id).unwrap();
    assert_eq!(after.updated, 4);
    assert_eq!(after.last_pinged, NOW);
    assert_eq!(after.status, Status::Up);
}

#[test]
fn concurrent_disconnects_have_one_winner() {
    let state = test_store();
    let c = state.create_cluster("c", ManagedState::Managed, 0).unwrap().id;
    let host = up_host(&state, c, "h", 5, NOW);
    let host = fire(&state, host.id, HostEvent::Ping, 5, NOW);
    let snapshot = fire(&state, host.id, HostEvent::Ping, 5, NOW);
    assert_eq!(snapshot.updated, 4);

    let barrier = &Barrier::new(2);
    let (state, snapshot) = (&state, &snapshot);
    let results: Vec<bool> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(move || {
                    let ctx = HostTransitionContext::new(5, NOW + 1);
                    barrier.wait();
                    host_status_machine()
                        .transit(snapshot, HostEvent::AgentDisconnected, &ctx, state)
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|&&won| won).count(), 1);
    let after = state.require_host(host.id).unwrap();
    assert_eq!(after.updated, 5);
    assert_eq!(after.status, Status::Alert);
    assert_eq!(after.management_server_id, None);
}

#[tokio::test]
async fn vm_start_on_last_host_then_stop_keeps_affinity() {
    let state = test_store();
    let c = state.create_cluster("c", ManagedState::Managed, 0).unwrap().id;
    let host = up_host(&state, c, "h7", 5, NOW);
    let coordinator = VmCoordinator::new(state.clone(), Arc::new(SimulatedDriver::new()));

    let vm = coordinator
        .allocate(
            NewVm {
                name: "vm-1".into(),
                details: VmDetails::User {
                    display_name: "vm-1".into(),
                    ha_enabled: false,
                },
                private_ip: None,
                private_mac: None,
            },
            NOW,
        )
        .unwrap();
    coordinator.start(vm.id, Some(host.id), NOW).await.unwrap();
    let stopped = coordinator.stop(vm.id, NOW).await.unwrap();
    assert_eq!(
        (stopped.state, stopped.host_id, stopped.last_host_id),
        (VmState::Stopped, None, Some(host.id))
    );

    let running = coordinator.start(vm.id, None, NOW + 1).await.unwrap();
    assert_eq!(
        (running.state, running.host_id, running.last_host_id),
        (VmState::Running, Some(host.id), Some(host.id))
    );
    // A coordinated start commits twice: Stopped -> Starting on the request,
    // Starting -> Running on the agent's confirmation.
    assert_eq!(running.updated, stopped.updated + 2);

    let stopped_again = coordinator.stop(vm.id, NOW + 2).await.unwrap();
    assert_eq!(
        (stopped_again.state, stopped_again.host_id, stopped_again.last_host_id),
        (VmState::Stopped, None, Some(host.id))
    );

    // An agent report moves Stopped to Running in a single committed write.
    let reported = coordinator
        .handle_power_report(host.id, vm.id, PowerReport::Running, NOW + 3)
        .unwrap();
    assert_eq!(
        (reported.state, reported.host_id, reported.last_host_id),
        (VmState::Running, Some(host.id), Some(host.id))
    );
    assert_eq!(reported.updated, stopped_again.updated + 1);
}

#[test]
fn racing_adoptions_never_split_a_cluster() {
    let state = test_store();
    let c = state.create_cluster("c", ManagedState::Managed, 0).unwrap().id;
    for i in 0..3 {
        state.create_host(new_host(&format!("h{i}"), c), 0).unwrap();
    }
    let a = partitioner(&state, 5, NOW);
    let b = partitioner(&state, 6, NOW);

    let barrier = Barrier::new(2);
    thread::scope(|s| {
        for p in [&a, &b] {
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                p.pass(NOW).unwrap();
            });
        }
    });

    let owners: Vec<_> = state
        .list_hosts_in_cluster(c)
        .unwrap()
        .iter()
        .map(|h| h.management_server_id)
        .collect();
    assert_eq!(owners.len(), 3);
    assert!(owners[0].is_some());
    assert!(owners.iter().all(|o| *o == owners[0]));
}

#[test]
fn dead_peer_hosts_are_released_then_claimed() {
    let state = test_store();
    let c = state.create_cluster("c", ManagedState::Managed, 0).unwrap().id;
    state.create_host(new_host("h", c), 0).unwrap();
    state.adopt_clusters(9, &[c], NOW, 50).unwrap();
    let host_id = state.hosts_owned_by(9).unwrap()[0].id;
    fire(&state, host_id, HostEvent::AgentConnected, 9, NOW - 100);
    fire(&state, host_id, HostEvent::Ready, 9, NOW - 100);
    state.join_mshost(9, "ms-9", 1, NOW - 100).unwrap();

    let p11 = partitioner(&state, 11, NOW);
    let first = p11.pass(NOW).unwrap();
    assert_eq!(first.dead_peers, vec![9]);
    assert_eq!(first.peer_reclaimed, vec![host_id]);
    assert_eq!(first.claimed(), 0);

    let released = state.require_host(host_id).unwrap();
    assert_eq!(released.status, Status::Disconnected);
    assert_eq!(released.management_server_id, None);
    assert_eq!(released.last_pinged, NOW - 600);

    let second = p11.pass(NOW + 1).unwrap();
    assert_eq!(second.adopted, vec![host_id]);
    assert!(state.require_host(host_id).unwrap().is_owned_by(11));
}

#[test]
fn live_peer_keeps_its_hosts() {
    let state = test_store();
    let c = state.create_cluster("c", ManagedState::Managed, 0).unwrap().id;
    let host = up_host(&state, c, "h", 9, NOW - 100);
    state.join_mshost(9, "ms-9", 1, NOW - 5).unwrap();

    let p11 = partitioner(&state, 11, NOW);
    let report = p11.pass(NOW).unwrap();
    assert!(report.dead_peers.is_empty());
    assert!(report.is_quiet());
    assert!(state.require_host(host.id).unwrap().is_owned_by(9));
}
