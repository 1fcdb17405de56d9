//! VM lifecycle machine, shared by every VM subtype.

use std::fmt;
use std::sync::OnceLock;

use fleet_fsm::{StateMachine, Stateful, TransitionTable};
use serde::{Deserialize, Serialize};

use crate::types::VirtualMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Migrating,
    Expunging,
    Destroyed,
    Error,
}

impl VmState {
    /// States in which `host_id` may be non-null. Entering any other state clears it.
    pub fn holds_host(self) -> bool {
        matches!(
            self,
            VmState::Starting
                | VmState::Running
                | VmState::Stopping
                | VmState::Migrating
                | VmState::Error
        )
    }

    /// Entering this state records the host as `last_host_id`.
    pub fn stamps_last_host(self) -> bool {
        self == VmState::Running
    }

    /// Entering this state forgets `last_host_id`: the VM will never run again.
    pub fn clears_last_host(self) -> bool {
        self == VmState::Expunging
    }

    /// Entering this state requires a target host.
    pub fn requires_host(self) -> bool {
        matches!(self, VmState::Starting | VmState::Running | VmState::Migrating)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmEvent {
    Start,
    OperationRetry,
    OperationSucceeded,
    OperationFailed,
    OperationFailedToError,
    Stop,
    Migrate,
    AgentReportRunning,
    AgentReportStopped,
    AgentReportMigrated,
    Destroy,
    Recover,
    Expunge,
}

impl fmt::Display for VmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Stateful<VmState> for VirtualMachine {
    fn current_state(&self) -> VmState {
        self.state
    }
}

pub type VmMachine = StateMachine<VmState, VmEvent, VirtualMachine>;

pub fn vm_machine() -> &'static VmMachine {
    static MACHINE: OnceLock<VmMachine> = OnceLock::new();
    MACHINE.get_or_init(|| StateMachine::new("vm", vm_table()))
}

fn vm_table() -> TransitionTable<VmState, VmEvent> {
    use VmEvent as E;
    use VmState as S;

    TransitionTable::new()
        .with(S::Creating, E::Start, S::Starting)
        .with(S::Creating, E::OperationSucceeded, S::Stopped)
        .with(S::Creating, E::OperationFailed, S::Error)
        .with(S::Creating, E::Destroy, S::Destroyed)
        // Stopped
        .with(S::Stopped, E::Start, S::Starting)
        .with(S::Stopped, E::Stop, S::Stopped)
        .with(S::Stopped, E::AgentReportStopped, S::Stopped)
        .with(S::Stopped, E::AgentReportRunning, S::Running)
        .with(S::Stopped, E::OperationFailed, S::Error)
        .with(S::Stopped, E::Destroy, S::Destroyed)
        .with(S::Stopped, E::Expunge, S::Expunging)
        // Starting
        .with(S::Starting, E::OperationRetry, S::Starting)
        .with(S::Starting, E::OperationSucceeded, S::Running)
        .with(S::Starting, E::OperationFailed, S::Stopped)
        .with(S::Starting, E::OperationFailedToError, S::Error)
        .with(S::Starting, E::AgentReportRunning, S::Running)
        .with(S::Starting, E::AgentReportStopped, S::Stopped)
        // Running
        .with(S::Running, E::Stop, S::Stopping)
        .with(S::Running, E::Migrate, S::Migrating)
        .with(S::Running, E::OperationSucceeded, S::Running)
        .with(S::Running, E::AgentReportRunning, S::Running)
        .with(S::Running, E::AgentReportStopped, S::Stopped)
        .with(S::Running, E::AgentReportMigrated, S::Running)
        // Stopping
        .with(S::Stopping, E::Stop, S::Stopping)
        .with(S::Stopping, E::OperationSucceeded, S::Stopped)
        .with(S::Stopping, E::OperationFailed, S::Running)
        .with(S::Stopping, E::AgentReportRunning, S::Running)
        .with(S::Stopping, E::AgentReportStopped, S::Stopped)
        // Migrating
        .with(S::Migrating, E::Migrate, S::Migrating)
        .with(S::Migrating, E::OperationSucceeded, S::Running)
        .with(S::Migrating, E::OperationFailed, S::Running)
        .with(S::Migrating, E::AgentReportRunning, S::Running)
        .with(S::Migrating, E::AgentReportStopped, S::Stopped)
        .with(S::Migrating, E::AgentReportMigrated, S::Running)
        // Destroyed
        .with(S::Destroyed, E::Recover, S::Stopped)
        .with(S::Destroyed, E::Expunge, S::Expunging)
        // Expunging
        .with(S::Expunging, E::Expunge, S::Expunging)
        .with(S::Expunging, E::OperationFailed, S::Expunging)
        // Error
        .with(S::Error, E::Destroy, S::Destroyed)
        .with(S::Error, E::Expunge, S::Expunging)
}
