//! VM lifecycle coordinator.
//!
//! Each operation is a "request" transition, a command to the agent, then a
//! "completion" transition. No store transaction is held while the command
//! is in flight. A completion that finds the VM already moved on (an agent
//! report got there first) is dropped.

use std::sync::Arc;

use fleet_agent::{AgentDriver, Answer, Command, DriverError};
use fleet_core::FleetConfig;
use fleet_fsm::{Attempt, RetryOutcome, retry_transition};
use fleet_state::{
    HostId, NewVm, ResourceState, StateStore, Status, VirtualMachine, VmEvent, VmId, VmState,
    VmTransitionContext, vm_machine,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, LifecycleResult};

/// Power state reported by a host agent for one of its VMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerReport {
    Running,
    Stopped,
    Migrated,
}

impl PowerReport {
    fn event(self) -> VmEvent {
        match self {
            PowerReport::Running => VmEvent::AgentReportRunning,
            PowerReport::Stopped => VmEvent::AgentReportStopped,
            PowerReport::Migrated => VmEvent::AgentReportMigrated,
        }
    }
}

/// What the fresh read says to do.
enum Decision {
    Apply(VmEvent, VmTransitionContext),
    /// Nothing to write; the VM is already where the caller wants it.
    Settled,
}

enum Driven {
    /// Committed; carries the snapshot the transition was applied to.
    Applied(VirtualMachine),
    Settled(VirtualMachine),
}

pub struct VmCoordinator {
    state: StateStore,
    driver: Arc<dyn AgentDriver>,
    max_retries: u32,
}

impl VmCoordinator {
    pub fn new(state: StateStore, driver: Arc<dyn AgentDriver>) -> Self {
        Self {
            state,
            driver,
            max_retries: 3,
        }
    }

    pub fn from_config(
        state: StateStore,
        driver: Arc<dyn AgentDriver>,
        config: &FleetConfig,
    ) -> Self {
        Self::new(state, driver).with_max_retries(config.agent.max_retries)
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Record a new VM and finish provisioning it into `Stopped`.
    pub fn allocate(&self, new: NewVm, now: u64) -> LifecycleResult<VirtualMachine> {
        let vm = self.state.create_vm(new, now)?;
        self.complete(
            vm.id,
            VmState::Creating,
            VmEvent::OperationSucceeded,
            VmTransitionContext::on_host(None, now),
        )?;
        let vm = self.fetch(vm.id)?;
        info!(vm_id = vm.id, vm_type = ?vm.vm_type(), "vm allocated");
        Ok(vm)
    }

    /// Start a VM on `host_id`, or on its last host when `None`.
    pub async fn start(
        &self,
        vm_id: VmId,
        host_id: Option<HostId>,
        now: u64,
    ) -> LifecycleResult<VirtualMachine> {
        let vm = self.fetch(vm_id)?;
        let target = host_id
            .or(vm.last_host_id)
            .ok_or(LifecycleError::NoHost(vm_id))?;
        self.check_host(target)?;

        let prev = match self.request(vm_id, VmEvent::Start, |_| {
            VmTransitionContext::on_host(Some(target), now)
        })? {
            Driven::Applied(prev) => prev,
            Driven::Settled(vm) => return Ok(vm),
        };

        let command = Command::StartVm {
            vm_id,
            name: prev.name.clone(),
        };
        let answer = self.driver.send_command(target, command).await;
        self.finish(
            vm_id,
            target,
            VmState::Starting,
            answer,
            VmTransitionContext::on_host(Some(target), now),
            VmTransitionContext::on_host(None, now),
        )?;
        info!(vm_id, host_id = target, "vm started");
        self.fetch(vm_id)
    }

    /// Stop a running VM. Stopping a stopped VM is a no-op.
    pub async fn stop(&self, vm_id: VmId, now: u64) -> LifecycleResult<VirtualMachine> {
        let prev = match self.request(vm_id, VmEvent::Stop, |vm| {
            VmTransitionContext::on_host(vm.host_id, now)
        })? {
            Driven::Applied(prev) => prev,
            Driven::Settled(vm) => return Ok(vm),
        };

        let Some(host_id) = prev.host_id else {
            self.complete(
                vm_id,
                VmState::Stopping,
                VmEvent::OperationSucceeded,
                VmTransitionContext::on_host(None, now),
            )?;
            return self.fetch(vm_id);
        };
        let answer = self.driver.send_command(host_id, Command::StopVm { vm_id }).await;
        self.finish(
            vm_id,
            host_id,
            VmState::Stopping,
            answer,
            VmTransitionContext::on_host(None, now),
            VmTransitionContext::on_host(Some(host_id), now),
        )?;
        info!(vm_id, host_id, "vm stopped");
        self.fetch(vm_id)
    }

    /// Live-migrate a running VM to `destination`.
    ///
    /// The VM stays recorded on its source host until the agent confirms.
    pub async fn migrate(
        &self,
        vm_id: VmId,
        destination: HostId,
        now: u64,
    ) -> LifecycleResult<VirtualMachine> {
        let vm = self.fetch(vm_id)?;
        if vm.state == VmState::Running && vm.host_id == Some(destination) {
            return Ok(vm);
        }
        self.check_host(destination)?;

        let prev = match self.request(vm_id, VmEvent::Migrate, |vm| {
            VmTransitionContext::on_host(vm.host_id, now)
        })? {
            Driven::Applied(prev) => prev,
            Driven::Settled(vm) => return Ok(vm),
        };
        let source = prev.host_id.ok_or(LifecycleError::NoHost(vm_id))?;

        let answer = self
            .driver
            .send_command(source, Command::MigrateVm { vm_id, destination })
            .await;
        self.finish(
            vm_id,
            source,
            VmState::Migrating,
            answer,
            VmTransitionContext::on_host(Some(destination), now),
            VmTransitionContext::on_host(Some(source), now),
        )?;
        info!(vm_id, source, destination, "vm migrated");
        self.fetch(vm_id)
    }

    /// Administrative removal: `Destroyed` plus scrubbed network identity,
    /// written together.
    pub fn remove(&self, vm_id: VmId, now: u64) -> LifecycleResult<VirtualMachine> {
        self.request(vm_id, VmEvent::Destroy, |_| VmTransitionContext::removal(now))?;
        info!(vm_id, "vm removed");
        self.fetch(vm_id)
    }

    /// Bring a destroyed VM back to `Stopped`.
    pub fn recover(&self, vm_id: VmId, now: u64) -> LifecycleResult<VirtualMachine> {
        self.request(vm_id, VmEvent::Recover, |_| VmTransitionContext::on_host(None, now))?;
        info!(vm_id, "vm recovered");
        self.fetch(vm_id)
    }

    /// Move a VM to `Expunging`, clean it up on its last host and delete the row.
    ///
    /// Returns `false` if the agent refused or could not be reached; the VM
    /// stays `Expunging` with its cleanup host recorded, and a later call
    /// sends the cleanup again.
    pub async fn expunge(&self, vm_id: VmId, now: u64) -> LifecycleResult<bool> {
        let vm = match self.request(vm_id, VmEvent::Expunge, |_| {
            VmTransitionContext::on_host(None, now)
        })? {
            Driven::Applied(_) => self.fetch(vm_id)?,
            Driven::Settled(vm) => vm,
        };

        if let Some(host_id) = vm.cleanup_host_id {
            match self.driver.send_command(host_id, Command::ExpungeVm { vm_id }).await {
                Ok(answer) if answer.success => {}
                Ok(answer) => {
                    warn!(vm_id, host_id, details = %answer.details, "expunge refused by agent");
                    return Ok(false);
                }
                Err(e) => {
                    warn!(vm_id, host_id, error = %e, "expunge not delivered");
                    return Ok(false);
                }
            }
        }
        let deleted = self.state.delete_vms(&[vm_id])? == 1;
        info!(vm_id, deleted, "vm expunged");
        Ok(deleted)
    }

    /// Reconcile the VM row with what an agent says is actually happening.
    ///
    /// A report that repeats what the row already says writes nothing, and
    /// so does a stop reported by a host the VM has moved away from.
    pub fn handle_power_report(
        &self,
        host_id: HostId,
        vm_id: VmId,
        report: PowerReport,
        now: u64,
    ) -> LifecycleResult<VirtualMachine> {
        let machine = vm_machine();
        let event = report.event();
        let reported_host = match report {
            PowerReport::Stopped => None,
            PowerReport::Running | PowerReport::Migrated => Some(host_id),
        };
        self.drive(vm_id, |vm| {
            if report == PowerReport::Stopped && left_host(vm, host_id) {
                debug!(
                    vm_id,
                    host_id,
                    state = %vm.state,
                    current = ?vm.host_id,
                    "stale stop report"
                );
                return Ok(Decision::Settled);
            }
            let Some(next) = machine.next_state(vm.state, event) else {
                return Err(rejected(vm, event));
            };
            let expected_host = if next.holds_host() { reported_host } else { None };
            if next == vm.state && vm.host_id == expected_host {
                return Ok(Decision::Settled);
            }
            Ok(Decision::Apply(event, VmTransitionContext::on_host(reported_host, now)))
        })?;
        self.fetch(vm_id)
    }

    pub fn get(&self, vm_id: VmId) -> LifecycleResult<VirtualMachine> {
        self.fetch(vm_id)
    }

    // ── internals ──────────────────────────────────────────────────

    fn fetch(&self, vm_id: VmId) -> LifecycleResult<VirtualMachine> {
        self.state.get_vm(vm_id)?.ok_or(LifecycleError::NotFound(vm_id))
    }

    fn check_host(&self, host_id: HostId) -> LifecycleResult<()> {
        let unavailable = |reason: String| LifecycleError::HostUnavailable { host_id, reason };
        let host = self
            .state
            .get_host(host_id)?
            .ok_or_else(|| unavailable("not found".into()))?;
        if host.is_removed() {
            return Err(unavailable("removed".into()));
        }
        if host.status != Status::Up {
            return Err(unavailable(format!("status {}", host.status)));
        }
        if host.resource_state != ResourceState::Enabled {
            return Err(unavailable(format!("resource state {}", host.resource_state)));
        }
        Ok(())
    }

    /// Apply a user request. A self-transition (already stopping, already
    /// expunging) settles without a write.
    fn request(
        &self,
        vm_id: VmId,
        event: VmEvent,
        ctx: impl Fn(&VirtualMachine) -> VmTransitionContext,
    ) -> LifecycleResult<Driven> {
        let machine = vm_machine();
        self.drive(vm_id, |vm| match machine.next_state(vm.state, event) {
            None => Err(rejected(vm, event)),
            Some(next) if next == vm.state => Ok(Decision::Settled),
            Some(_) => Ok(Decision::Apply(event, ctx(vm))),
        })
    }

    /// Apply a completion event if the VM is still `expected`.
    fn complete(
        &self,
        vm_id: VmId,
        expected: VmState,
        event: VmEvent,
        ctx: VmTransitionContext,
    ) -> LifecycleResult<()> {
        let driven = self.drive(vm_id, |vm| {
            Ok(if vm.state == expected {
                Decision::Apply(event, ctx)
            } else {
                Decision::Settled
            })
        })?;
        if let Driven::Settled(vm) = driven {
            debug!(vm_id, %expected, state = %vm.state, %event, "completion superseded");
        }
        Ok(())
    }

    /// Record the agent's answer: success or failure completion.
    fn finish(
        &self,
        vm_id: VmId,
        host_id: HostId,
        expected: VmState,
        answer: Result<Answer, DriverError>,
        on_success: VmTransitionContext,
        on_failure: VmTransitionContext,
    ) -> LifecycleResult<()> {
        let failure = match answer {
            Ok(answer) if answer.success => {
                return self.complete(vm_id, expected, VmEvent::OperationSucceeded, on_success);
            }
            Ok(answer) => LifecycleError::CommandFailed {
                vm_id,
                host_id,
                details: answer.details,
            },
            Err(e) => LifecycleError::Driver(e),
        };
        warn!(vm_id, host_id, state = %expected, error = %failure, "vm operation failed");
        self.complete(vm_id, expected, VmEvent::OperationFailed, on_failure)?;
        Err(failure)
    }

    /// Read, decide, transition; re-read on a lost race.
    fn drive(
        &self,
        vm_id: VmId,
        mut decide: impl FnMut(&VirtualMachine) -> LifecycleResult<Decision>,
    ) -> LifecycleResult<Driven> {
        let machine = vm_machine();
        let outcome = retry_transition(self.max_retries, |round| -> LifecycleResult<Attempt<_>> {
            let vm = self.fetch(vm_id)?;
            let (event, ctx) = match decide(&vm)? {
                Decision::Apply(event, ctx) => (event, ctx),
                Decision::Settled => return Ok(Attempt::Moot(Driven::Settled(vm))),
            };
            match machine.transit(&vm, event, &ctx, &self.state) {
                Ok(true) => Ok(Attempt::Committed(Driven::Applied(vm))),
                Ok(false) => {
                    debug!(vm_id, round, %event, "vm changed underneath, re-reading");
                    Ok(Attempt::Stale)
                }
                Err(e) if e.is_no_transition() => Err(rejected(&vm, event)),
                Err(e) => Err(e.into()),
            }
        })?;
        match outcome {
            RetryOutcome::Committed(driven) | RetryOutcome::Moot(driven) => Ok(driven),
            RetryOutcome::Exhausted { attempts } => {
                Err(LifecycleError::Contended { vm_id, attempts })
            }
        }
    }
}

/// The VM is recorded on another host, or is mid-migration and its source
/// is expected to see it stop.
fn left_host(vm: &VirtualMachine, host_id: HostId) -> bool {
    vm.state == VmState::Migrating || vm.host_id.is_some_and(|current| current != host_id)
}

fn rejected(vm: &VirtualMachine, event: VmEvent) -> LifecycleError {
    LifecycleError::Rejected {
        id: vm.id,
        state: vm.state,
        event,
    }
}
