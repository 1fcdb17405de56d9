//! Membership manager: management-server heartbeats.
//!
//! Each process keeps one heartbeat row keyed by its msid. Peers are judged
//! alive or dead purely from how old that row is; nothing is pushed between
//! processes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fleet_core::epoch_secs;
use fleet_state::{ManagementServerHost, MsState, Msid, StateResult, StateStore};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ClusterError, ClusterResult};

/// Liveness of a management server as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    /// Heartbeat within `peer_timeout`.
    Alive,
    /// Row still says Up, but the heartbeat is older than `peer_timeout`.
    Stale,
    /// Marked Down by a peer or by a graceful leave.
    Down,
}

/// A management server with its computed liveness.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub msid: Msid,
    pub name: String,
    pub status: MemberStatus,
    pub run_id: u64,
    pub last_update: u64,
}

impl Member {
    pub fn is_alive(&self) -> bool {
        self.status == MemberStatus::Alive
    }
}

/// Tracks this process's heartbeat row and its view of its peers.
pub struct MembershipManager {
    state: StateStore,
    msid: Msid,
    name: String,
    /// Distinguishes this run from earlier runs of the same msid.
    run_id: u64,
    /// Peers silent for longer than this are dead.
    peer_timeout: Duration,
    heartbeat_interval: Duration,
}

impl MembershipManager {
    pub fn new(state: StateStore, msid: Msid, name: impl Into<String>) -> Self {
        Self {
            state,
            msid,
            name: name.into(),
            run_id: fresh_run_id(),
            peer_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
        }
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_run_id(mut self, run_id: u64) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn msid(&self) -> Msid {
        self.msid
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn peer_timeout(&self) -> Duration {
        self.peer_timeout
    }

    /// Heartbeats at or before this instant are stale.
    pub fn peer_cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(self.peer_timeout.as_secs())
    }

    /// Write this process's heartbeat row, replacing any earlier run.
    pub fn join(&self, now: u64) -> StateResult<()> {
        self.state.join_mshost(self.msid, &self.name, self.run_id, now)?;
        Ok(())
    }

    /// Refresh the heartbeat row.
    ///
    /// A missing row is re-created. A row owned by a newer run means another
    /// process started with this msid; that is reported as `Superseded`.
    pub fn heartbeat(&self, now: u64) -> ClusterResult<()> {
        if self.state.heartbeat_mshost(self.msid, self.run_id, now)? {
            debug!(msid = self.msid, "heartbeat written");
            return Ok(());
        }
        match self.state.get_mshost(self.msid)? {
            None => {
                warn!(msid = self.msid, "heartbeat row missing, rejoining");
                self.join(now)?;
                Ok(())
            }
            Some(row) => Err(ClusterError::Superseded {
                msid: self.msid,
                run_id: row.run_id,
            }),
        }
    }

    /// Mark this run Down on graceful shutdown.
    pub fn leave(&self) -> StateResult<bool> {
        let left = self.state.leave_mshost(self.msid, self.run_id)?;
        if left {
            info!(msid = self.msid, "management server left");
        }
        Ok(left)
    }

    /// All management servers, including this one.
    pub fn list_members(&self, now: u64) -> StateResult<Vec<Member>> {
        let cutoff = self.peer_cutoff(now);
        Ok(self
            .state
            .list_mshosts()?
            .into_iter()
            .map(|row| to_member(row, cutoff))
            .collect())
    }

    /// Other processes with a fresh heartbeat.
    pub fn active_peers(&self, now: u64) -> StateResult<Vec<Member>> {
        Ok(self
            .list_members(now)?
            .into_iter()
            .filter(|m| m.msid != self.msid && m.is_alive())
            .collect())
    }

    /// Other processes that are Down or have gone silent.
    pub fn inactive_peers(&self, now: u64) -> StateResult<Vec<Member>> {
        Ok(self
            .list_members(now)?
            .into_iter()
            .filter(|m| m.msid != self.msid && !m.is_alive())
            .collect())
    }

    /// Mark a silent peer Down. No-op if it heartbeated since `now - peer_timeout`.
    pub fn mark_down(&self, peer: Msid, now: u64) -> StateResult<bool> {
        let marked = self.state.mark_mshost_down(peer, self.peer_cutoff(now))?;
        if marked {
            warn!(peer, "peer management server declared down");
        }
        Ok(marked)
    }

    /// Run the heartbeat loop until `shutdown` flips, then leave.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            msid = self.msid,
            interval = ?self.heartbeat_interval,
            "heartbeat loop started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.heartbeat_interval) => {
                    match self.heartbeat(epoch_secs()) {
                        Ok(()) => {}
                        Err(e @ ClusterError::Superseded { .. }) => {
                            error!(error = %e, "stopping heartbeat loop");
                            return;
                        }
                        Err(e) => warn!(msid = self.msid, error = %e, "heartbeat failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(msid = self.msid, "heartbeat loop shutting down");
                    break;
                }
            }
        }

        if let Err(e) = self.leave() {
            warn!(msid = self.msid, error = %e, "failed to mark management server down");
        }
    }
}

fn to_member(row: ManagementServerHost, cutoff: u64) -> Member {
    let status = match row.state {
        MsState::Down => MemberStatus::Down,
        MsState::Up if row.last_update <= cutoff => MemberStatus::Stale,
        MsState::Up => MemberStatus::Alive,
    };
    Member {
        msid: row.msid,
        name: row.name,
        status,
        run_id: row.run_id,
        last_update: row.last_update,
    }
}

fn fresh_run_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
