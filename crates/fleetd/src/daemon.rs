//! Daemon wiring: one store, one set of control loops per management server.
//!
//! A redb file is held open by a single OS process, so several management
//! servers sharing one store run as tasks inside this process. They still
//! coordinate only through the store.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use fleet_agent::{AgentDriver, HostSupervisor, SimulatedDriver};
use fleet_cluster::{MembershipManager, OwnershipPartitioner};
use fleet_core::{FleetConfig, epoch_secs};
use fleet_state::{
    HostType, ManagedState, Msid, NewHost, NewVm, StateError, StateStore, VmDetails,
};
use fleet_vm::VmCoordinator;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

const DB_FILE: &str = "fleet.redb";

pub async fn run(config: FleetConfig, msids: Vec<Msid>, simulate: bool) -> anyhow::Result<()> {
    if !simulate {
        bail!("no agent transport is built in; run with --simulate");
    }
    info!(msids = ?msids, "fleet daemon starting");

    let data_dir = &config.server.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let db_path = data_dir.join(DB_FILE);
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let driver: Arc<dyn AgentDriver> = Arc::new(SimulatedDriver::new());
    if let Some(&first) = msids.first() {
        seed_demo_inventory(&state, first, driver.clone(), &config)?;
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for &msid in &msids {
        handles.extend(spawn_management_server(
            state.clone(),
            msid,
            driver.clone(),
            &config,
            shutdown_rx.clone(),
        )?);
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    info!("fleet daemon stopped");
    Ok(())
}

/// Join the heartbeat table and spawn the loops of one management server.
fn spawn_management_server(
    state: StateStore,
    msid: Msid,
    driver: Arc<dyn AgentDriver>,
    config: &FleetConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let name = if msid == config.server.msid {
        config.server.name.clone()
    } else {
        format!("fleet-ms-{msid}")
    };
    let membership = Arc::new(
        MembershipManager::new(state.clone(), msid, name)
            .with_peer_timeout(config.heartbeat.peer_timeout())
            .with_heartbeat_interval(config.heartbeat.interval()),
    );
    membership.join(epoch_secs())?;
    info!(msid, run_id = membership.run_id(), "management server joined");

    let partitioner = OwnershipPartitioner::from_config(state.clone(), membership.clone(), config);
    let supervisor = HostSupervisor::from_config(state, msid, driver, config);

    let heartbeat_shutdown = shutdown.clone();
    let partition_shutdown = shutdown.clone();
    Ok(vec![
        tokio::spawn(async move { membership.run(heartbeat_shutdown).await }),
        tokio::spawn(async move { partitioner.run(partition_shutdown).await }),
        tokio::spawn(async move { supervisor.run(shutdown).await }),
    ])
}

/// Give a fresh store something to manage: two managed clusters, one
/// unmanaged, and a few stopped VMs.
fn seed_demo_inventory(
    state: &StateStore,
    msid: Msid,
    driver: Arc<dyn AgentDriver>,
    config: &FleetConfig,
) -> anyhow::Result<()> {
    if !state.list_clusters()?.is_empty() {
        return Ok(());
    }
    let now = epoch_secs();
    let supervisor = HostSupervisor::from_config(state.clone(), msid, driver.clone(), config);
    for (name, managed, hosts) in [
        ("pod-a", ManagedState::Managed, 3),
        ("pod-b", ManagedState::Managed, 2),
        ("pod-lab", ManagedState::Unmanaged, 1),
    ] {
        let cluster = state.create_cluster(name, managed, now)?;
        for i in 0..hosts {
            let guid = format!("{name}-kvm-{i}");
            supervisor.register_host(
                NewHost {
                    guid: guid.clone(),
                    name: guid,
                    host_type: HostType::Routing,
                    hypervisor: "kvm".into(),
                    private_ip: Some(format!("10.{}.0.{}", cluster.id, i + 10)),
                    cluster_id: cluster.id,
                },
                now,
            )?;
        }
    }

    let vms = VmCoordinator::from_config(state.clone(), driver, config);
    vms.allocate(
        NewVm {
            name: "web-1".into(),
            details: VmDetails::User {
                display_name: "web".into(),
                ha_enabled: true,
            },
            private_ip: Some("10.200.0.5".into()),
            private_mac: Some("02:00:0a:c8:00:05".into()),
        },
        now,
    )?;
    vms.allocate(
        NewVm {
            name: "r-1-VM".into(),
            details: VmDetails::DomainRouter {
                public_ip: Some("203.0.113.10".into()),
                guest_ip: Some("10.200.0.1".into()),
                redundant: false,
            },
            private_ip: Some("169.254.3.1".into()),
            private_mac: Some("0e:00:a9:fe:03:01".into()),
        },
        now,
    )?;
    info!("demo inventory seeded");
    Ok(())
}

/// Snapshot of the store for `fleetd status`.
pub fn status(data_dir: &Path) -> anyhow::Result<Value> {
    let db_path = data_dir.join(DB_FILE);
    let state = StateStore::open(&db_path)
        .with_context(|| format!("opening {} (is fleetd running?)", db_path.display()))?;

    let members: Vec<Value> = state
        .list_mshosts()?
        .into_iter()
        .map(|ms| {
            json!({
                "msid": ms.msid,
                "name": ms.name,
                "state": ms.state,
                "last_update": ms.last_update,
            })
        })
        .collect();

    let mut clusters = Vec::new();
    for cluster in state.list_clusters()? {
        let owner = match state.owner_of_cluster(cluster.id) {
            Ok(owner) => json!(owner),
            Err(StateError::Conflict(_)) => json!("split"),
            Err(e) => return Err(e.into()),
        };
        clusters.push(json!({
            "id": cluster.id,
            "name": cluster.name,
            "managed_state": cluster.managed_state,
            "owner": owner,
            "hosts": state.list_hosts_in_cluster(cluster.id)?.len(),
        }));
    }

    let hosts: Vec<Value> = state
        .list_hosts()?
        .into_iter()
        .map(|host| {
            json!({
                "id": host.id,
                "name": host.name,
                "cluster_id": host.cluster_id,
                "status": host.status,
                "resource_state": host.resource_state,
                "owner": host.management_server_id,
                "last_pinged": host.last_pinged,
            })
        })
        .collect();

    let vms: Vec<Value> = state
        .list_vms()?
        .into_iter()
        .map(|vm| {
            json!({
                "id": vm.id,
                "name": vm.name,
                "type": vm.vm_type(),
                "state": vm.state,
                "host_id": vm.host_id,
                "last_host_id": vm.last_host_id,
            })
        })
        .collect();

    Ok(json!({
        "management_servers": members,
        "clusters": clusters,
        "hosts": hosts,
        "vms": vms,
    }))
}
