//! Host supervisor: drives host status from agent connectivity.

use std::sync::Arc;
use std::time::Duration;

use fleet_core::{FleetConfig, epoch_secs};
use fleet_fsm::{Attempt, RetryOutcome, retry_transition};
use fleet_state::{
    Host, HostEvent, HostId, HostTransitionContext, Msid, NewHost, ResourceEvent, StateStore,
    Status, host_status_machine, resource_state_machine,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::driver::{AgentDriver, Command};
use crate::error::{SupervisorError, SupervisorResult};

/// What one poll of the owned hosts did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    /// Hosts brought to Up from a disconnected state.
    pub connected: Vec<HostId>,
    pub pinged: Vec<HostId>,
    /// Hosts whose agent did not answer.
    pub unreachable: Vec<HostId>,
    /// Hosts moved to Alert by the ping-timeout sweep.
    pub timed_out: Vec<HostId>,
}

/// Supervises the hosts owned by one management server.
pub struct HostSupervisor {
    state: StateStore,
    msid: Msid,
    driver: Arc<dyn AgentDriver>,
    /// How often an Up host is health-checked.
    ping_interval: Duration,
    /// Silence after which an Up host is declared timed out.
    ping_timeout: Duration,
    /// Attempts per event before giving up on a contended host.
    max_retries: u32,
    poll_interval: Duration,
}

impl HostSupervisor {
    pub fn new(state: StateStore, msid: Msid, driver: Arc<dyn AgentDriver>) -> Self {
        Self {
            state,
            msid,
            driver,
            ping_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(150),
            max_retries: 3,
            poll_interval: Duration::from_secs(10),
        }
    }

    pub fn from_config(
        state: StateStore,
        msid: Msid,
        driver: Arc<dyn AgentDriver>,
        config: &FleetConfig,
    ) -> Self {
        Self::new(state, msid, driver)
            .with_ping_interval(config.agent.ping_interval())
            .with_ping_timeout(config.agent.ping_timeout())
            .with_max_retries(config.agent.max_retries)
            .with_poll_interval(config.ownership.scan_interval())
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn msid(&self) -> Msid {
        self.msid
    }

    // ── Registration ───────────────────────────────────────────────

    /// Record a newly discovered host and mark it administratively created.
    ///
    /// The host starts unowned; the ownership partitioner assigns it.
    pub fn register_host(&self, new: NewHost, now: u64) -> SupervisorResult<Host> {
        let host = self.state.create_host(new, now)?;
        info!(
            host_id = host.id,
            guid = %host.guid,
            cluster_id = host.cluster_id,
            "host registered"
        );
        self.apply_resource_event(host.id, ResourceEvent::InternalCreated)
    }

    // ── Connectivity events ────────────────────────────────────────

    pub fn agent_connected(&self, host_id: HostId, now: u64) -> SupervisorResult<Host> {
        self.apply_status_event(host_id, HostEvent::AgentConnected, now)
    }

    pub fn agent_ready(&self, host_id: HostId, now: u64) -> SupervisorResult<Host> {
        self.apply_status_event(host_id, HostEvent::Ready, now)
    }

    pub fn ping(&self, host_id: HostId, now: u64) -> SupervisorResult<Host> {
        self.apply_status_event(host_id, HostEvent::Ping, now)
    }

    pub fn agent_disconnected(&self, host_id: HostId, now: u64) -> SupervisorResult<Host> {
        self.apply_status_event(host_id, HostEvent::AgentDisconnected, now)
    }

    pub fn host_down(&self, host_id: HostId, now: u64) -> SupervisorResult<Host> {
        self.apply_status_event(host_id, HostEvent::HostDown, now)
    }

    /// Decommission a host. Any management server may do this.
    pub fn remove_host(&self, host_id: HostId, now: u64) -> SupervisorResult<Host> {
        let host = self.apply_status_event(host_id, HostEvent::Remove, now)?;
        info!(host_id, "host removed");
        Ok(host)
    }

    /// Apply `event` to the current row, re-reading after each lost race.
    ///
    /// Targets that check ownership are refused up front when another
    /// process owns the host.
    pub fn apply_status_event(
        &self,
        host_id: HostId,
        event: HostEvent,
        now: u64,
    ) -> SupervisorResult<Host> {
        let machine = host_status_machine();
        let ctx = HostTransitionContext::new(self.msid, now);
        self.with_retries(host_id, |host| {
            if let Some(next) = machine.next_state(host.status, event)
                && next.checks_owner()
                && let Some(owner) = host.management_server_id.filter(|&o| o != self.msid)
            {
                return Err(SupervisorError::NotOwner { host_id, owner });
            }
            Ok(machine.transit(host, event, &ctx, &self.state)?)
        })
    }

    // ── Administrative (resource state) ────────────────────────────

    pub fn enable_host(&self, host_id: HostId) -> SupervisorResult<Host> {
        self.apply_resource_event(host_id, ResourceEvent::Enable)
    }

    pub fn disable_host(&self, host_id: HostId) -> SupervisorResult<Host> {
        self.apply_resource_event(host_id, ResourceEvent::Disable)
    }

    pub fn prepare_for_maintenance(&self, host_id: HostId) -> SupervisorResult<Host> {
        self.apply_resource_event(host_id, ResourceEvent::AdminAskMaintenance)
    }

    pub fn cancel_maintenance(&self, host_id: HostId) -> SupervisorResult<Host> {
        self.apply_resource_event(host_id, ResourceEvent::AdminCancelMaintenance)
    }

    /// Enter Maintenance once no VM is placed on the host.
    pub fn complete_maintenance(&self, host_id: HostId) -> SupervisorResult<Host> {
        let vms: Vec<_> = self
            .state
            .list_vms_by_host(host_id)?
            .into_iter()
            .map(|vm| vm.id)
            .collect();
        if !vms.is_empty() {
            return Err(SupervisorError::HostBusy { host_id, vms });
        }
        self.apply_resource_event(host_id, ResourceEvent::InternalEnterMaintenance)
    }

    pub fn apply_resource_event(
        &self,
        host_id: HostId,
        event: ResourceEvent,
    ) -> SupervisorResult<Host> {
        let machine = resource_state_machine();
        let host = self.with_retries(host_id, |host| {
            Ok(machine.transit(host, event, &(), &self.state)?)
        })?;
        debug!(host_id, %event, resource_state = %host.resource_state, "resource state changed");
        Ok(host)
    }

    fn with_retries(
        &self,
        host_id: HostId,
        mut attempt: impl FnMut(&Host) -> SupervisorResult<bool>,
    ) -> SupervisorResult<Host> {
        let outcome = retry_transition(self.max_retries, |round| -> SupervisorResult<Attempt<()>> {
            let host = self.state.require_host(host_id)?;
            if attempt(&host)? {
                Ok(Attempt::Committed(()))
            } else {
                debug!(host_id, round, "host changed underneath, re-reading");
                Ok(Attempt::Stale)
            }
        })?;
        match outcome {
            RetryOutcome::Committed(()) | RetryOutcome::Moot(()) => {
                Ok(self.state.require_host(host_id)?)
            }
            RetryOutcome::Exhausted { attempts } => {
                Err(SupervisorError::Contended { host_id, attempts })
            }
        }
    }

    // ── Polling ────────────────────────────────────────────────────

    /// Health-check owned hosts that are due, then sweep ping timeouts.
    ///
    /// No store transaction is open while a command is in flight.
    pub async fn poll_once(&self, now: u64) -> SupervisorResult<PollReport> {
        let mut report = PollReport::default();
        for host in self.state.hosts_owned_by(self.msid)? {
            let reconnect = matches!(
                host.status,
                Status::Creating
                    | Status::Connecting
                    | Status::Disconnected
                    | Status::Alert
                    | Status::Down
            );
            let ping_due = host.status == Status::Up
                && now.saturating_sub(host.last_pinged) >= self.ping_interval.as_secs();
            if !reconnect && !ping_due {
                continue;
            }

            match self.driver.send_command(host.id, Command::CheckHealth).await {
                Ok(answer) if answer.success => {}
                Ok(answer) => {
                    debug!(
                        host_id = host.id,
                        details = %answer.details,
                        "agent reported unhealthy"
                    );
                    report.unreachable.push(host.id);
                    continue;
                }
                Err(e) => {
                    debug!(host_id = host.id, error = %e, "agent did not answer");
                    report.unreachable.push(host.id);
                    continue;
                }
            }

            let result = if reconnect {
                self.agent_connected(host.id, now)
                    .and_then(|_| self.agent_ready(host.id, now))
                    .map(|_| report.connected.push(host.id))
            } else {
                self.ping(host.id, now).map(|_| report.pinged.push(host.id))
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => warn!(host_id = host.id, error = %e, "host event not applied"),
            }
        }

        report.timed_out = self.sweep_ping_timeouts(now)?;
        Ok(report)
    }

    /// Fire `PingTimeout` on owned hosts silent for longer than the ping timeout.
    ///
    /// One attempt per host; a host that changed since the read is left for
    /// the next sweep.
    pub fn sweep_ping_timeouts(&self, now: u64) -> SupervisorResult<Vec<HostId>> {
        let cutoff = now.saturating_sub(self.ping_timeout.as_secs());
        let ctx = HostTransitionContext::new(self.msid, now);
        let mut timed_out = Vec::new();
        for host in self.state.hosts_owned_by(self.msid)? {
            let watched = matches!(host.status, Status::Up | Status::Connecting);
            if !watched || host.last_pinged >= cutoff {
                continue;
            }
            match host_status_machine().transit(&host, HostEvent::PingTimeout, &ctx, &self.state) {
                Ok(true) => {
                    warn!(host_id = host.id, last_pinged = host.last_pinged, "host ping timed out");
                    timed_out.push(host.id);
                }
                Ok(false) => debug!(host_id = host.id, "host changed before ping timeout applied"),
                Err(e) if e.is_no_transition() => {
                    warn!(host_id = host.id, error = %e, "ping timeout rejected")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(timed_out)
    }

    /// Poll every `poll_interval` until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            msid = self.msid,
            interval = ?self.poll_interval,
            ping_timeout = ?self.ping_timeout,
            "host supervisor started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once(epoch_secs()).await {
                        Ok(report) => {
                            if !report.connected.is_empty() || !report.timed_out.is_empty() {
                                info!(
                                    msid = self.msid,
                                    connected = report.connected.len(),
                                    timed_out = report.timed_out.len(),
                                    unreachable = report.unreachable.len(),
                                    "host poll complete"
                                );
                            }
                        }
                        Err(e) => error!(msid = self.msid, error = %e, "host poll failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(msid = self.msid, "host supervisor shutting down");
                    break;
                }
            }
        }
    }
}
