//! Ownership claims and releases.
//!
//! Each function here is one partitioning phase: it re-reads its candidate
//! rows inside a single write transaction, which holds the store's write
//! lock, and claims or releases only rows that still satisfy the phase
//! predicate. Candidates are taken in ascending host id order and capped
//! by the caller's limit.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{Rows, StateStore, put_row, scan};
use crate::error::{StateError, StateResult};
use crate::tables::{CLUSTERS, HOSTS};
use crate::types::*;

/// Result of trying to adopt one fully unowned cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdoptOutcome {
    /// `hosts` were claimed for the caller.
    Adopted {
        cluster_id: ClusterId,
        hosts: Vec<HostId>,
    },
    /// Another process claimed a host in the cluster after the candidate scan.
    Contended { cluster_id: ClusterId, owner: Msid },
    /// Nothing to claim: every host is fresh, removed, or the cluster is no
    /// longer Managed.
    Idle { cluster_id: ClusterId },
}

impl AdoptOutcome {
    pub fn claimed(&self) -> &[HostId] {
        match self {
            AdoptOutcome::Adopted { hosts, .. } => hosts,
            _ => &[],
        }
    }
}

/// A host the caller may claim: unowned, live, and stale past the deadline.
fn is_claimable(host: &Host, deadline: u64) -> bool {
    host.management_server_id.is_none() && !host.is_removed() && host.last_pinged <= deadline
}

/// Set `management_server_id` on `host` and bump its version.
fn claim(hosts: &mut Rows<'_>, mut host: Host, msid: Msid) -> StateResult<HostId> {
    host.management_server_id = Some(msid);
    host.updated += 1;
    put_row(hosts, host.id, &host)?;
    Ok(host.id)
}

/// Distinct non-null owners of the live hosts in each cluster.
fn owners_by_cluster(hosts: &[Host]) -> BTreeMap<ClusterId, BTreeSet<Msid>> {
    let mut owners: BTreeMap<ClusterId, BTreeSet<Msid>> = BTreeMap::new();
    for host in hosts.iter().filter(|h| !h.is_removed()) {
        let entry = owners.entry(host.cluster_id).or_default();
        if let Some(msid) = host.management_server_id {
            entry.insert(msid);
        }
    }
    owners
}

impl StateStore {
    /// Release every host `msid` owns that lost its connection and has not
    /// pinged since `deadline`.
    pub fn release_stale_hosts(&self, msid: Msid, deadline: u64) -> StateResult<Vec<HostId>> {
        let released = self.write(|txn| {
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let stale = scan::<Host>(&hosts, |h| {
                h.is_owned_by(msid) && h.status.is_reclaimable() && h.last_pinged <= deadline
            })?;
            let mut released = Vec::with_capacity(stale.len());
            for mut host in stale {
                host.management_server_id = None;
                host.updated += 1;
                put_row(&mut hosts, host.id, &host)?;
                released.push(host.id);
            }
            Ok(released)
        })?;
        if !released.is_empty() {
            debug!(msid, count = released.len(), "released stale hosts");
        }
        Ok(released)
    }

    /// Claim up to `limit` claimable hosts in `clusters` for `msid`.
    ///
    /// A cluster is skipped if it is no longer Managed or if any of its
    /// hosts is owned by a different process.
    pub fn claim_hosts_in_clusters(
        &self,
        msid: Msid,
        clusters: &BTreeSet<ClusterId>,
        deadline: u64,
        limit: usize,
    ) -> StateResult<Vec<HostId>> {
        if limit == 0 || clusters.is_empty() {
            return Ok(Vec::new());
        }
        self.write(|txn| {
            let managed = managed_clusters(txn)?;
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let all = scan::<Host>(&hosts, |h| clusters.contains(&h.cluster_id))?;
            let owners = owners_by_cluster(&all);

            let mut claimed = Vec::new();
            for host in all {
                if claimed.len() >= limit {
                    break;
                }
                let eligible_cluster = managed.contains(&host.cluster_id)
                    && owners
                        .get(&host.cluster_id)
                        .is_some_and(|o| o.iter().all(|&owner| owner == msid));
                if eligible_cluster && is_claimable(&host, deadline) {
                    claimed.push(claim(&mut hosts, host, msid)?);
                }
            }
            Ok(claimed)
        })
    }

    /// Managed clusters with at least one live host and no owned host at all.
    ///
    /// This is a read snapshot; [`adopt_clusters`](Self::adopt_clusters)
    /// re-verifies each candidate under the write lock.
    pub fn fully_unowned_managed_clusters(&self) -> StateResult<Vec<ClusterId>> {
        self.read(|txn| {
            let clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let managed: BTreeSet<ClusterId> = scan::<Cluster>(&clusters, Cluster::is_managed)?
                .into_iter()
                .map(|c| c.id)
                .collect();
            let all = scan::<Host>(&hosts, |h| managed.contains(&h.cluster_id))?;
            Ok(owners_by_cluster(&all)
                .into_iter()
                .filter(|(_, owners)| owners.is_empty())
                .map(|(cluster_id, _)| cluster_id)
                .collect())
        })
    }

    /// Adopt `candidates` for `msid`, claiming at most `limit` hosts overall.
    ///
    /// Runs in one transaction. Each cluster is re-checked first: if any of
    /// its live hosts is now owned by another process the cluster is left
    /// untouched. Clusters after the limit is reached are not reported.
    pub fn adopt_clusters(
        &self,
        msid: Msid,
        candidates: &[ClusterId],
        deadline: u64,
        limit: usize,
    ) -> StateResult<Vec<AdoptOutcome>> {
        if limit == 0 || candidates.is_empty() {
            return Ok(Vec::new());
        }
        self.write(|txn| {
            let managed = managed_clusters(txn)?;
            let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut remaining = limit;
            let mut outcomes = Vec::new();

            for &cluster_id in candidates {
                if remaining == 0 {
                    break;
                }
                if !managed.contains(&cluster_id) {
                    outcomes.push(AdoptOutcome::Idle { cluster_id });
                    continue;
                }
                let members =
                    scan::<Host>(&hosts, |h| h.cluster_id == cluster_id && !h.is_removed())?;
                if let Some(owner) = members
                    .iter()
                    .filter_map(|h| h.management_server_id)
                    .find(|&owner| owner != msid)
                {
                    outcomes.push(AdoptOutcome::Contended { cluster_id, owner });
                    continue;
                }

                let mut claimed = Vec::new();
                for host in members.into_iter().filter(|h| is_claimable(h, deadline)) {
                    if claimed.len() >= remaining {
                        break;
                    }
                    claimed.push(claim(&mut hosts, host, msid)?);
                }
                remaining -= claimed.len();
                outcomes.push(if claimed.is_empty() {
                    AdoptOutcome::Idle { cluster_id }
                } else {
                    AdoptOutcome::Adopted {
                        cluster_id,
                        hosts: claimed,
                    }
                });
            }
            Ok(outcomes)
        })
    }

    /// The single owner of a cluster's live hosts, if any.
    ///
    /// Two distinct owners would break cluster exclusivity and are reported
    /// as a conflict.
    pub fn owner_of_cluster(&self, cluster_id: ClusterId) -> StateResult<Option<Msid>> {
        let owners: BTreeSet<Msid> = self
            .list_hosts_in_cluster(cluster_id)?
            .into_iter()
            .filter(|h| !h.is_removed())
            .filter_map(|h| h.management_server_id)
            .collect();
        let mut iter = owners.iter();
        match (iter.next(), iter.next()) {
            (None, _) => Ok(None),
            (Some(&owner), None) => Ok(Some(owner)),
            (Some(a), Some(b)) => Err(StateError::Conflict(format!(
                "cluster {cluster_id} split between {a} and {b}"
            ))),
        }
    }
}

fn managed_clusters(txn: &redb::WriteTransaction) -> StateResult<BTreeSet<ClusterId>> {
    let clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
    Ok(scan::<Cluster>(&clusters, Cluster::is_managed)?
        .into_iter()
        .map(|c| c.id)
        .collect())
}
