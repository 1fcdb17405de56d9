//! Host rows: registration, lookups and the two host conditional updates.

use std::collections::BTreeSet;

use fleet_fsm::StateDao;
use redb::ReadableTable;
use tracing::debug;

use super::{StateStore, get_row, next_id, put_row, scan};
use crate::error::{StateError, StateResult};
use crate::resource::{ResourceEvent, ResourceState};
use crate::status::{HostEvent, Status};
use crate::tables::{CLUSTERS, HOSTS};
use crate::types::*;

/// Who performs a host status transition, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTransitionContext {
    /// The msid the write is performed as. Normally the caller; when a dead
    /// peer's hosts are reaped this is the peer, so its ownership check passes.
    pub owner: Msid,
    /// Unix seconds.
    pub now: u64,
    /// How far `ManagementServerDown` pushes `last_pinged` into the past.
    pub ms_down_pushback: u64,
}

impl HostTransitionContext {
    pub fn new(owner: Msid, now: u64) -> Self {
        Self {
            owner,
            now,
            ms_down_pushback: 0,
        }
    }

    pub fn with_pushback(mut self, secs: u64) -> Self {
        self.ms_down_pushback = secs;
        self
    }
}

impl StateStore {
    /// Register a host in `Creating`, unowned and never pinged.
    pub fn create_host(&self, new: NewHost, now: u64) -> StateResult<Host> {
        let mut created = self.create_hosts(vec![new], now)?;
        created
            .pop()
            .ok_or_else(|| StateError::Write("host insert produced no row".into()))
    }

    /// Register several hosts in one transaction. Either all land or none do.
    pub fn create_hosts(&self, batch: Vec<NewHost>, now: u64) -> StateResult<Vec<Host>> {
        let created = self.write(|txn| {
            let clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut live_guids: BTreeSet<String> = scan::<Host>(&hosts, |h| !h.is_removed())?
                .into_iter()
                .map(|h| h.guid)
                .collect();

            let mut created = Vec::with_capacity(batch.len());
            for new in batch {
                if clusters
                    .get(new.cluster_id)
                    .map_err(map_err!(Read))?
                    .is_none()
                {
                    return Err(StateError::NotFound(format!("cluster {}", new.cluster_id)));
                }
                if !live_guids.insert(new.guid.clone()) {
                    return Err(StateError::Conflict(format!(
                        "host guid {} already registered",
                        new.guid
                    )));
                }
                let host = Host {
                    id: next_id(txn, "host")?,
                    guid: new.guid,
                    name: new.name,
                    host_type: new.host_type,
                    hypervisor: new.hypervisor,
                    private_ip: new.private_ip,
                    cluster_id: new.cluster_id,
                    status: Status::Creating,
                    resource_state: ResourceState::Creating,
                    management_server_id: None,
                    last_pinged: 0,
                    updated: 0,
                    created: now,
                    removed: None,
                };
                put_row(&mut hosts, host.id, &host)?;
                created.push(host);
            }
            Ok(created)
        })?;
        debug!(count = created.len(), "hosts registered");
        Ok(created)
    }

    pub fn get_host(&self, id: HostId) -> StateResult<Option<Host>> {
        self.read(|txn| {
            let hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            get_row(&hosts, id)
        })
    }

    /// Like [`get_host`](Self::get_host), but a missing row is an error.
    pub fn require_host(&self, id: HostId) -> StateResult<Host> {
        self.get_host(id)?
            .ok_or_else(|| StateError::NotFound(format!("host {id}")))
    }

    pub fn list_hosts(&self) -> StateResult<Vec<Host>> {
        self.select_hosts(|_| true)
    }

    pub fn list_hosts_in_cluster(&self, cluster_id: ClusterId) -> StateResult<Vec<Host>> {
        self.select_hosts(|h| h.cluster_id == cluster_id)
    }

    /// The live (non-removed) host registered under `guid`.
    pub fn find_host_by_guid(&self, guid: &str) -> StateResult<Option<Host>> {
        Ok(self
            .select_hosts(|h| h.guid == guid && !h.is_removed())?
            .into_iter()
            .next())
    }

    /// Hosts currently claimed by `msid`.
    pub fn hosts_owned_by(&self, msid: Msid) -> StateResult<Vec<Host>> {
        self.select_hosts(|h| h.is_owned_by(msid))
    }

    /// Distinct clusters in which `msid` owns at least one host.
    pub fn clusters_owned_by(&self, msid: Msid) -> StateResult<BTreeSet<ClusterId>> {
        Ok(self
            .hosts_owned_by(msid)?
            .into_iter()
            .map(|h| h.cluster_id)
            .collect())
    }

    fn select_hosts(&self, keep: impl FnMut(&Host) -> bool) -> StateResult<Vec<Host>> {
        self.read(|txn| {
            let hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            scan(&hosts, keep)
        })
    }
}

/// Host connectivity update.
///
/// Matches on id, status and `updated`. The target status adds the owner
/// predicate and, for liveness-driven targets, the `last_pinged` predicate.
impl StateDao<Status, HostEvent> for StateStore {
    type Entity = Host;
    type Context = HostTransitionContext;
    type Error = StateError;

    fn update_state(
        &self,
        current: Status,
        event: HostEvent,
        next: Status,
        host: &Host,
        ctx: &HostTransitionContext,
    ) -> StateResult<bool> {
        self.write(|txn| {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let Some(mut row) = get_row::<Host>(&hosts, host.id)? else {
                return Ok(false);
            };
            if row.status != current || row.updated != host.updated {
                return Ok(false);
            }
            if next.checks_owner() && row.is_owned_by_other(ctx.owner) {
                return Ok(false);
            }
            if next.checks_liveness() && row.last_pinged != host.last_pinged {
                return Ok(false);
            }

            row.status = next;
            row.updated += 1;
            row.management_server_id = if next.loses_connection() {
                None
            } else {
                Some(ctx.owner)
            };
            if event.refreshes_ping() {
                row.last_pinged = ctx.now;
            } else if event == HostEvent::ManagementServerDown {
                row.last_pinged = ctx.now.saturating_sub(ctx.ms_down_pushback);
            }
            if next == Status::Removed {
                row.removed = Some(ctx.now);
            }
            put_row(&mut hosts, row.id, &row)?;
            Ok(true)
        })
    }
}

/// Host administrative update. Keyed on `resource_state` alone; `status`,
/// ownership and `updated` are never read or written here.
impl StateDao<ResourceState, ResourceEvent> for StateStore {
    type Entity = Host;
    type Context = ();
    type Error = StateError;

    fn update_state(
        &self,
        current: ResourceState,
        _event: ResourceEvent,
        next: ResourceState,
        host: &Host,
        _ctx: &(),
    ) -> StateResult<bool> {
        self.write(|txn| {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let Some(mut row) = get_row::<Host>(&hosts, host.id)? else {
                return Ok(false);
            };
            if row.resource_state != current {
                return Ok(false);
            }
            row.resource_state = next;
            put_row(&mut hosts, row.id, &row)?;
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;
    use crate::resource::resource_state_machine;
    use crate::status::host_status_machine;
    use crate::store::fixtures::*;

    /// Put a registered host straight into `status` owned by `owner`.
    fn seed(store: &StateStore, status: Status, owner: Option<Msid>, last_pinged: u64) -> Host {
        let c = managed_cluster(store, "c1");
        let host = store.create_host(new_host("h1", c), 0).unwrap();
        store
            .write(|txn| {
                let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
                let mut row = host.clone();
                row.status = status;
                row.management_server_id = owner;
                row.last_pinged = last_pinged;
                row.updated = 3;
                put_row(&mut hosts, row.id, &row)
            })
            .unwrap();
        store.require_host(host.id).unwrap()
    }

    #[test]
    fn registration_rejects_unknown_cluster_and_duplicate_guid() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.create_host(new_host("a", 42), 0).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));

        let c = managed_cluster(&store, "c1");
        let host = store.create_host(new_host("a", c), 5).unwrap();
        assert_eq!(host.status, Status::Creating);
        assert_eq!(host.resource_state, ResourceState::Creating);
        assert_eq!(host.management_server_id, None);

        let err = store.create_host(new_host("a", c), 6).unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
    }

    #[test]
    fn batch_registration_is_all_or_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let c = managed_cluster(&store, "c1");
        let err = store
            .create_hosts(vec![new_host("a", c), new_host("a", c)], 0)
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
        assert!(store.list_hosts().unwrap().is_empty());

        let created = store
            .create_hosts(vec![new_host("a", c), new_host("b", c)], 0)
            .unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(store.list_hosts_in_cluster(c).unwrap().len(), 2);
    }

    #[test]
    fn ping_by_owner_bumps_version_and_refreshes_liveness() {
        let store = StateStore::open_in_memory().unwrap();
        let host = seed(&store, Status::Up, Some(5), 100);

        let ctx = HostTransitionContext::new(5, 1_000);
        assert!(host_status_machine().transit(&host, HostEvent::Ping, &ctx, &store).unwrap());

        let row = store.require_host(host.id).unwrap();
        assert_eq!(row.status, Status::Up);
        assert_eq!(row.updated, 4);
        assert_eq!(row.last_pinged, 1_000);
        assert_eq!(row.management_server_id, Some(5));
    }

    #[test]
    fn foreign_process_cannot_drive_an_owned_host() {
        let store = StateStore::open_in_memory().unwrap();
        let host = seed(&store, Status::Up, Some(5), 100);

        let ctx = HostTransitionContext::new(6, 1_000);
        assert!(!host_status_machine().transit(&host, HostEvent::Ping, &ctx, &store).unwrap());
        assert_eq!(store.require_host(host.id).unwrap().updated, 3);
    }

    #[test]
    fn losing_connection_clears_owner_in_the_same_write() {
        let store = StateStore::open_in_memory().unwrap();
        let host = seed(&store, Status::Up, Some(5), 100);

        let ctx = HostTransitionContext::new(5, 1_000);
        assert!(host_status_machine()
            .transit(&host, HostEvent::AgentDisconnected, &ctx, &store)
            .unwrap());
        let row = store.require_host(host.id).unwrap();
        assert_eq!(row.status, Status::Alert);
        assert_eq!(row.management_server_id, None);
        assert_eq!(row.last_pinged, 100);
    }

    #[test]
    fn liveness_driven_transition_requires_unchanged_last_pinged() {
        let store = StateStore::open_in_memory().unwrap();
        let host = seed(&store, Status::Up, Some(5), 100);
        let mut stale = host.clone();
        stale.last_pinged = 90;

        let ctx = HostTransitionContext::new(5, 1_000);
        assert!(!host_status_machine()
            .transit(&stale, HostEvent::PingTimeout, &ctx, &store)
            .unwrap());
        assert!(host_status_machine()
            .transit(&host, HostEvent::PingTimeout, &ctx, &store)
            .unwrap());
    }

    #[test]
    fn management_server_down_pushes_last_pinged_back() {
        let store = StateStore::open_in_memory().unwrap();
        let host = seed(&store, Status::Up, Some(9), 900);

        let ctx = HostTransitionContext::new(9, 1_000).with_pushback(600);
        assert!(host_status_machine()
            .transit(&host, HostEvent::ManagementServerDown, &ctx, &store)
            .unwrap());
        let row = store.require_host(host.id).unwrap();
        assert_eq!(row.status, Status::Disconnected);
        assert_eq!(row.management_server_id, None);
        assert_eq!(row.last_pinged, 400);
    }

    #[test]
    fn remove_soft_deletes() {
        let store = StateStore::open_in_memory().unwrap();
        let host = seed(&store, Status::Disconnected, None, 100);
        let ctx = HostTransitionContext::new(5, 2_000);
        assert!(host_status_machine().transit(&host, HostEvent::Remove, &ctx, &store).unwrap());

        let row = store.require_host(host.id).unwrap();
        assert_eq!(row.status, Status::Removed);
        assert_eq!(row.removed, Some(2_000));
        assert!(store.find_host_by_guid("h1").unwrap().is_none());
    }

    #[test]
    fn concurrent_disconnects_on_one_snapshot_have_one_winner() {
        let store = StateStore::open_in_memory().unwrap();
        let host = seed(&store, Status::Up, Some(5), 100);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (store, host, barrier) = (store.clone(), host.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    let ctx = HostTransitionContext::new(5, 1_000);
                    host_status_machine()
                        .transit(&host, HostEvent::AgentDisconnected, &ctx, &store)
                        .unwrap()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(store.require_host(host.id).unwrap().updated, 4);
    }

    #[test]
    fn resource_state_is_versioned_independently() {
        let store = StateStore::open_in_memory().unwrap();
        let host = seed(&store, Status::Up, Some(5), 100);

        assert!(resource_state_machine()
            .transit(&host, ResourceEvent::InternalCreated, &(), &store)
            .unwrap());
        let row = store.require_host(host.id).unwrap();
        assert_eq!(row.resource_state, ResourceState::Enabled);
        assert_eq!(row.updated, 3, "resource writes leave the status version alone");

        // The status snapshot taken before the resource write is still current.
        let ctx = HostTransitionContext::new(5, 1_000);
        assert!(host_status_machine().transit(&host, HostEvent::Ping, &ctx, &store).unwrap());
        let row = store.require_host(host.id).unwrap();
        assert_eq!(row.resource_state, ResourceState::Enabled);
        assert_eq!(row.updated, 4);
    }

    #[test]
    fn ownership_queries() {
        let store = StateStore::open_in_memory().unwrap();
        let host = seed(&store, Status::Up, Some(5), 100);
        assert_eq!(store.hosts_owned_by(5).unwrap(), vec![host.clone()]);
        assert_eq!(
            store.clusters_owned_by(5).unwrap().into_iter().collect::<Vec<_>>(),
            vec![host.cluster_id]
        );
        assert!(store.hosts_owned_by(6).unwrap().is_empty());
    }
}
