//! Ownership partitioner: converges every Managed cluster to one owner.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{FleetConfig, epoch_secs};
use fleet_state::{
    AdoptOutcome, ClusterId, HostEvent, HostId, HostTransitionContext, MsState, Msid, StateStore,
    host_status_machine,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::ClusterResult;
use crate::membership::MembershipManager;

/// What one partitioning pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    /// Own hosts released because their agent went away.
    pub reclaimed: Vec<HostId>,
    /// Unowned hosts claimed in clusters this process already owned.
    pub reacquired: Vec<HostId>,
    /// Clusters adopted (fully or up to the batch limit) this pass.
    pub adopted_clusters: Vec<ClusterId>,
    pub adopted: Vec<HostId>,
    /// Candidate clusters left alone because another process got there first.
    pub skipped_clusters: Vec<ClusterId>,
    /// Dead peers found this pass.
    pub dead_peers: Vec<Msid>,
    /// Hosts released from dead peers via `ManagementServerDown`.
    pub peer_reclaimed: Vec<HostId>,
}

impl PartitionReport {
    /// Hosts this process gained.
    pub fn claimed(&self) -> usize {
        self.reacquired.len() + self.adopted.len()
    }

    pub fn is_quiet(&self) -> bool {
        self.reclaimed.is_empty()
            && self.claimed() == 0
            && self.skipped_clusters.is_empty()
            && self.peer_reclaimed.is_empty()
    }
}

/// Runs the per-process ownership pass.
pub struct OwnershipPartitioner {
    state: StateStore,
    membership: Arc<MembershipManager>,
    /// Hosts silent for longer than this may change hands.
    liveness_timeout: Duration,
    /// Maximum hosts claimed per pass.
    batch_limit: usize,
    /// `last_pinged` pushback applied when a peer is declared down.
    ms_down_pushback: Duration,
    scan_interval: Duration,
}

impl OwnershipPartitioner {
    pub fn new(state: StateStore, membership: Arc<MembershipManager>) -> Self {
        Self {
            state,
            membership,
            liveness_timeout: Duration::from_secs(60),
            batch_limit: 50,
            ms_down_pushback: Duration::from_secs(600),
            scan_interval: Duration::from_secs(10),
        }
    }

    pub fn from_config(
        state: StateStore,
        membership: Arc<MembershipManager>,
        config: &FleetConfig,
    ) -> Self {
        Self::new(state, membership)
            .with_liveness_timeout(config.ownership.liveness_timeout())
            .with_batch_limit(config.ownership.batch_limit)
            .with_ms_down_pushback(config.agent.ms_down_ping_pushback())
            .with_scan_interval(config.ownership.scan_interval())
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn with_ms_down_pushback(mut self, pushback: Duration) -> Self {
        self.ms_down_pushback = pushback;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn msid(&self) -> Msid {
        self.membership.msid()
    }

    /// `last_pinged` at or before this instant counts as stale.
    pub fn liveness_deadline(&self, now: u64) -> u64 {
        now.saturating_sub(self.liveness_timeout.as_secs())
    }

    /// One partitioning pass at time `now` (unix seconds).
    ///
    /// Each phase commits in its own transaction. A store failure aborts
    /// the rest of the pass; phases already committed stay committed.
    pub fn pass(&self, now: u64) -> ClusterResult<PartitionReport> {
        let msid = self.msid();
        let deadline = self.liveness_deadline(now);
        let mut report = PartitionReport {
            reclaimed: self.state.release_stale_hosts(msid, deadline)?,
            ..Default::default()
        };

        let owned: BTreeSet<ClusterId> = self.state.clusters_owned_by(msid)?;
        report.reacquired =
            self.state
                .claim_hosts_in_clusters(msid, &owned, deadline, self.batch_limit)?;

        let remaining = self.batch_limit.saturating_sub(report.reacquired.len());
        if remaining > 0 {
            let candidates = self.state.fully_unowned_managed_clusters()?;
            for outcome in self
                .state
                .adopt_clusters(msid, &candidates, deadline, remaining)?
            {
                match outcome {
                    AdoptOutcome::Adopted { cluster_id, hosts } => {
                        info!(msid, cluster_id, hosts = hosts.len(), "adopted cluster");
                        report.adopted_clusters.push(cluster_id);
                        report.adopted.extend(hosts);
                    }
                    AdoptOutcome::Contended { cluster_id, owner } => {
                        debug!(msid, cluster_id, owner, "cluster claimed by a peer, skipping");
                        report.skipped_clusters.push(cluster_id);
                    }
                    AdoptOutcome::Idle { .. } => {}
                }
            }
        }

        self.reap_dead_peers(now, deadline, &mut report)?;
        Ok(report)
    }

    /// Fire `ManagementServerDown` on the stale hosts of every dead peer.
    ///
    /// A host that pinged after `deadline` keeps its owner this pass. Hosts
    /// released here are claimed on a later pass, not this one.
    fn reap_dead_peers(
        &self,
        now: u64,
        deadline: u64,
        report: &mut PartitionReport,
    ) -> ClusterResult<()> {
        let msid = self.msid();
        let known: BTreeSet<Msid> = self
            .membership
            .list_members(now)?
            .into_iter()
            .map(|m| m.msid)
            .collect();
        let mut dead: BTreeSet<Msid> = BTreeSet::new();
        for peer in self.membership.inactive_peers(now)? {
            // A peer that heartbeated since our read is alive after all.
            if self.membership.mark_down(peer.msid, now)?
                || self
                    .state
                    .get_mshost(peer.msid)?
                    .is_some_and(|row| row.state == MsState::Down)
            {
                dead.insert(peer.msid);
            }
        }
        // Owners that never wrote a heartbeat row at all.
        for host in self.state.list_hosts()? {
            if let Some(owner) = host.management_server_id
                && owner != msid
                && !known.contains(&owner)
            {
                dead.insert(owner);
            }
        }

        for &peer in &dead {
            let ctx = HostTransitionContext::new(peer, now)
                .with_pushback(self.ms_down_pushback.as_secs());
            for host in self.state.hosts_owned_by(peer)? {
                if host.last_pinged > deadline {
                    continue;
                }
                match host_status_machine().transit(
                    &host,
                    HostEvent::ManagementServerDown,
                    &ctx,
                    &self.state,
                ) {
                    Ok(true) => report.peer_reclaimed.push(host.id),
                    Ok(false) => debug!(host_id = host.id, peer, "peer host changed, skipping"),
                    Err(e) if e.is_no_transition() => {
                        warn!(host_id = host.id, peer, error = %e, "cannot release peer host")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if !report.peer_reclaimed.is_empty() {
            warn!(
                msid,
                peers = ?dead,
                hosts = report.peer_reclaimed.len(),
                "released hosts of dead management servers"
            );
        }
        report.dead_peers = dead.into_iter().collect();
        Ok(())
    }

    /// Run passes every `scan_interval` until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            msid = self.msid(),
            interval = ?self.scan_interval,
            batch_limit = self.batch_limit,
            "ownership partitioner started"
        );

        let mut ticker = tokio::time::interval(self.scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.pass(epoch_secs()) {
                        Ok(report) if report.is_quiet() => {
                            debug!(msid = self.msid(), "partition pass: no changes")
                        }
                        Ok(report) => info!(
                            msid = self.msid(),
                            reclaimed = report.reclaimed.len(),
                            reacquired = report.reacquired.len(),
                            adopted = report.adopted.len(),
                            skipped = report.skipped_clusters.len(),
                            peer_reclaimed = report.peer_reclaimed.len(),
                            "partition pass complete"
                        ),
                        Err(e) if e.is_retriable() => {
                            warn!(
                                msid = self.msid(),
                                error = %e,
                                "partition pass aborted, retrying next tick"
                            )
                        }
                        Err(e) => error!(msid = self.msid(), error = %e, "partition pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(msid = self.msid(), "ownership partitioner shutting down");
                    break;
                }
            }
        }
    }
}
