//! Store-level guarantees checked under concurrency.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use fleet_cluster::{MembershipManager, OwnershipPartitioner};
use fleet_state::*;

const NOW: u64 = 2_000_000;

fn test_store() -> StateStore {
    StateStore::open_in_memory().unwrap()
}

fn add_hosts(state: &StateStore, cluster_id: ClusterId, prefix: &str, count: usize) -> Vec<HostId> {
    (0..count)
        .map(|i| {
            let guid = format!("{prefix}-{i}");
            state
                .create_host(
                    NewHost {
                        guid: guid.clone(),
                        name: guid,
                        host_type: HostType::Routing,
                        hypervisor: "kvm".into(),
                        private_ip: None,
                        cluster_id,
                    },
                    0,
                )
                .unwrap()
                .id
        })
        .collect()
}

fn owners_by_cluster(state: &StateStore) -> BTreeMap<ClusterId, BTreeSet<Msid>> {
    let mut owners: BTreeMap<ClusterId, BTreeSet<Msid>> = BTreeMap::new();
    for host in state.list_hosts().unwrap() {
        let entry = owners.entry(host.cluster_id).or_default();
        if let Some(owner) = host.management_server_id {
            entry.insert(owner);
        }
    }
    owners
}

#[test]
fn only_one_of_many_identical_snapshots_commits() {
    let state = test_store();
    let c = state.create_cluster("c", ManagedState::Managed, 0).unwrap().id;
    let id = add_hosts(&state, c, "h", 1)[0];
    let ctx = HostTransitionContext::new(5, NOW);
    let host = state.require_host(id).unwrap();
    assert!(host_status_machine().transit(&host, HostEvent::AgentConnected, &ctx, &state).unwrap());
    let snapshot = state.require_host(id).unwrap();

    let workers = 8;
    let barrier = &Barrier::new(workers);
    let (state_ref, snapshot_ref, ctx_ref) = (&state, &snapshot, &ctx);
    let wins = thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                s.spawn(move || {
                    barrier.wait();
                    host_status_machine()
                        .transit(snapshot_ref, HostEvent::Ready, ctx_ref, state_ref)
                        .unwrap()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count()
    });

    assert_eq!(wins, 1);
    let after = state.require_host(id).unwrap();
    assert_eq!(after.updated, snapshot.updated + 1);
    assert_eq!(after.status, Status::Up);
}

#[test]
fn versions_only_move_forward_one_step_at_a_time() {
    let state = test_store();
    let c = state.create_cluster("c", ManagedState::Managed, 0).unwrap().id;
    let id = add_hosts(&state, c, "h", 1)[0];
    let machine = host_status_machine();

    let script = [
        (HostEvent::AgentConnected, 5),
        (HostEvent::Ready, 5),
        (HostEvent::Ping, 6),
        (HostEvent::Ping, 5),
        (HostEvent::Ready, 5),
        (HostEvent::AgentDisconnected, 5),
        (HostEvent::Ping, 7),
        (HostEvent::HostDown, 7),
        (HostEvent::AgentConnected, 5),
        (HostEvent::Ready, 5),
        (HostEvent::Remove, 6),
    ];
    let mut last = state.require_host(id).unwrap().updated;
    for (step, (event, msid)) in script.into_iter().enumerate() {
        let before = state.require_host(id).unwrap();
        let ctx = HostTransitionContext::new(msid, NOW + step as u64);
        let committed = match machine.transit(&before, event, &ctx, &state) {
            Ok(committed) => committed,
            Err(e) => {
                assert!(e.is_no_transition(), "{e}");
                false
            }
        };
        let after = state.require_host(id).unwrap();
        if committed {
            assert_eq!(after.updated, last + 1, "step {step}: {event}");
        } else {
            assert_eq!(after, before, "step {step}: {event}");
        }
        assert!(after.updated >= last);
        last = after.updated;
    }
    assert_eq!(state.require_host(id).unwrap().status, Status::Removed);
}

#[test]
fn events_missing_from_the_table_never_write() {
    let state = test_store();
    let c = state.create_cluster("c", ManagedState::Managed, 0).unwrap().id;
    let id = add_hosts(&state, c, "h", 1)[0];
    let host = state.require_host(id).unwrap();
    let machine = host_status_machine();
    let ctx = HostTransitionContext::new(5, NOW);

    let events = [
        HostEvent::AgentConnected,
        HostEvent::Ready,
        HostEvent::Ping,
        HostEvent::PingTimeout,
        HostEvent::AgentDisconnected,
        HostEvent::ShutdownRequested,
        HostEvent::HostDown,
        HostEvent::ManagementServerDown,
        HostEvent::WaitedTooLong,
        HostEvent::Remove,
        HostEvent::StartAgentRebalance,
        HostEvent::RebalanceCompleted,
        HostEvent::RebalanceFailed,
        HostEvent::Error,
    ];
    let mut rejected = 0;
    for event in events {
        if machine.next_state(host.status, event).is_some() {
            continue;
        }
        let err = machine.transit(&host, event, &ctx, &state).unwrap_err();
        assert!(err.is_no_transition());
        assert_eq!(state.require_host(id).unwrap(), host);
        rejected += 1;
    }
    assert!(rejected > 0);

    let vm = state
        .create_vm(
            NewVm {
                name: "vm".into(),
                details: VmDetails::ConsoleProxy {
                    public_ip: None,
                    active_sessions: 0,
                },
                private_ip: None,
                private_mac: None,
            },
            1,
        )
        .unwrap();
    let vm_ctx = VmTransitionContext::on_host(None, 2);
    for event in [VmEvent::Stop, VmEvent::Migrate, VmEvent::Recover, VmEvent::AgentReportMigrated] {
        let err = vm_machine().transit(&vm, event, &vm_ctx, &state).unwrap_err();
        assert!(err.is_no_transition());
    }
    assert_eq!(state.require_vm(vm.id).unwrap(), vm);
}

#[test]
fn concurrent_partitioners_keep_clusters_whole() {
    let state = test_store();
    let mut clusters = Vec::new();
    for (name, size) in [("a", 3), ("b", 5), ("c", 1), ("d", 4)] {
        let id = state.create_cluster(name, ManagedState::Managed, 0).unwrap().id;
        add_hosts(&state, id, name, size);
        clusters.push(id);
    }

    let partitioners: Vec<OwnershipPartitioner> = (1..=4)
        .map(|msid| {
            let membership = MembershipManager::new(state.clone(), msid, format!("ms-{msid}"));
            membership.join(NOW).unwrap();
            OwnershipPartitioner::new(state.clone(), Arc::new(membership)).with_batch_limit(2)
        })
        .collect();

    for round in 0..6 {
        let barrier = &Barrier::new(partitioners.len());
        thread::scope(|s| {
            for p in &partitioners {
                s.spawn(move || {
                    barrier.wait();
                    p.pass(NOW + round).unwrap();
                });
            }
        });
        for (cluster, owners) in owners_by_cluster(&state) {
            assert!(owners.len() <= 1, "round {round}: cluster {cluster} split {owners:?}");
        }
    }

    // With a batch limit of 2 every host is owned after a few rounds.
    assert!(state.list_hosts().unwrap().iter().all(|h| h.management_server_id.is_some()));
    for cluster in clusters {
        assert!(state.owner_of_cluster(cluster).unwrap().is_some());
    }
}

#[test]
fn fresh_hosts_are_never_taken_from_their_owner() {
    let state = test_store();
    let c = state.create_cluster("c", ManagedState::Managed, 0).unwrap().id;
    let ids = add_hosts(&state, c, "h", 3);
    state.adopt_clusters(9, &[c], NOW, 50).unwrap();
    for &id in &ids {
        let host = state.require_host(id).unwrap();
        let ctx = HostTransitionContext::new(9, NOW - 10);
        let machine = host_status_machine();
        assert!(machine.transit(&host, HostEvent::AgentConnected, &ctx, &state).unwrap());
    }
    // Process 9 itself has stopped heartbeating.
    state.join_mshost(9, "ms-9", 1, NOW - 500).unwrap();

    let membership = MembershipManager::new(state.clone(), 11, "ms-11")
        .with_peer_timeout(Duration::from_secs(30));
    membership.join(NOW).unwrap();
    let p11 = OwnershipPartitioner::new(state.clone(), Arc::new(membership))
        .with_liveness_timeout(Duration::from_secs(60));

    let report = p11.pass(NOW).unwrap();
    assert_eq!(report.dead_peers, vec![9]);
    assert!(report.peer_reclaimed.is_empty());
    assert_eq!(report.claimed(), 0);
    for id in ids {
        assert!(state.require_host(id).unwrap().is_owned_by(9));
    }
}
