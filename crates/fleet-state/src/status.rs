//! Host connectivity status machine.
//!
//! Every status write also sets `management_server_id`. Two flags per status
//! decide how, consulted by the conditional status update on
//! [`StateStore`](crate::StateStore):
//!
//! | status       | checks owner | loses connection |
//! |--------------|--------------|------------------|
//! | Creating     | no           | no               |
//! | Connecting   | yes          | no               |
//! | Up           | yes          | no               |
//! | Down         | yes          | yes              |
//! | Disconnected | yes          | yes              |
//! | Alert        | yes          | yes              |
//! | Removed      | no           | yes              |
//! | Error        | no           | yes              |
//! | Rebalancing  | no           | yes              |

use std::fmt;
use std::sync::OnceLock;

use fleet_fsm::{StateMachine, Stateful, TransitionTable};
use serde::{Deserialize, Serialize};

use crate::types::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Creating,
    Connecting,
    Up,
    Down,
    Disconnected,
    Alert,
    Removed,
    Error,
    Rebalancing,
}

impl Status {
    /// Only the owning process (or an unowned row) may enter this status.
    pub fn checks_owner(self) -> bool {
        matches!(
            self,
            Status::Connecting | Status::Up | Status::Down | Status::Disconnected | Status::Alert
        )
    }

    /// Entering this status drops the host's owner.
    pub fn loses_connection(self) -> bool {
        matches!(
            self,
            Status::Down
                | Status::Disconnected
                | Status::Alert
                | Status::Removed
                | Status::Error
                | Status::Rebalancing
        )
    }

    /// Entering this status is liveness-driven: the write also requires the
    /// caller's `last_pinged` to still be current.
    pub fn checks_liveness(self) -> bool {
        self.checks_owner() && self.loses_connection()
    }

    /// Statuses an owner releases its claim from once the liveness deadline passes.
    pub fn is_reclaimable(self) -> bool {
        matches!(self, Status::Disconnected | Status::Down | Status::Alert)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEvent {
    AgentConnected,
    Ready,
    Ping,
    PingTimeout,
    AgentDisconnected,
    ShutdownRequested,
    HostDown,
    ManagementServerDown,
    WaitedTooLong,
    Remove,
    StartAgentRebalance,
    RebalanceCompleted,
    RebalanceFailed,
    Error,
}

impl HostEvent {
    /// The write stamps `last_pinged` with the current time.
    pub fn refreshes_ping(self) -> bool {
        matches!(self, HostEvent::Ping | HostEvent::AgentConnected)
    }
}

impl fmt::Display for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Stateful<Status> for Host {
    fn current_state(&self) -> Status {
        self.status
    }
}

pub type HostStatusMachine = StateMachine<Status, HostEvent, Host>;

/// The process-wide host status machine.
pub fn host_status_machine() -> &'static HostStatusMachine {
    static MACHINE: OnceLock<HostStatusMachine> = OnceLock::new();
    MACHINE.get_or_init(|| StateMachine::new("host-status", status_table()))
}

fn status_table() -> TransitionTable<Status, HostEvent> {
    use HostEvent as E;
    use Status as S;

    TransitionTable::new()
        .with(S::Creating, E::AgentConnected, S::Connecting)
        .with(S::Creating, E::AgentDisconnected, S::Disconnected)
        .with(S::Creating, E::ManagementServerDown, S::Disconnected)
        .with(S::Creating, E::Remove, S::Removed)
        .with(S::Creating, E::Error, S::Error)
        // Connecting
        .with(S::Connecting, E::AgentConnected, S::Connecting)
        .with(S::Connecting, E::Ready, S::Up)
        .with(S::Connecting, E::Ping, S::Connecting)
        .with(S::Connecting, E::PingTimeout, S::Alert)
        .with(S::Connecting, E::AgentDisconnected, S::Alert)
        .with(S::Connecting, E::ShutdownRequested, S::Disconnected)
        .with(S::Connecting, E::HostDown, S::Alert)
        .with(S::Connecting, E::ManagementServerDown, S::Disconnected)
        .with(S::Connecting, E::Remove, S::Removed)
        .with(S::Connecting, E::Error, S::Error)
        // Up
        .with(S::Up, E::Ping, S::Up)
        .with(S::Up, E::AgentConnected, S::Connecting)
        .with(S::Up, E::PingTimeout, S::Alert)
        .with(S::Up, E::AgentDisconnected, S::Alert)
        .with(S::Up, E::ShutdownRequested, S::Disconnected)
        .with(S::Up, E::HostDown, S::Down)
        .with(S::Up, E::ManagementServerDown, S::Disconnected)
        .with(S::Up, E::StartAgentRebalance, S::Rebalancing)
        .with(S::Up, E::Remove, S::Removed)
        .with(S::Up, E::Error, S::Error)
        // Disconnected
        .with(S::Disconnected, E::AgentConnected, S::Connecting)
        .with(S::Disconnected, E::Ping, S::Up)
        .with(S::Disconnected, E::PingTimeout, S::Alert)
        .with(S::Disconnected, E::AgentDisconnected, S::Disconnected)
        .with(S::Disconnected, E::HostDown, S::Down)
        .with(S::Disconnected, E::ManagementServerDown, S::Disconnected)
        .with(S::Disconnected, E::WaitedTooLong, S::Alert)
        .with(S::Disconnected, E::Remove, S::Removed)
        .with(S::Disconnected, E::Error, S::Error)
        // Down
        .with(S::Down, E::AgentConnected, S::Connecting)
        .with(S::Down, E::Ping, S::Up)
        .with(S::Down, E::PingTimeout, S::Down)
        .with(S::Down, E::AgentDisconnected, S::Down)
        .with(S::Down, E::HostDown, S::Down)
        .with(S::Down, E::ManagementServerDown, S::Down)
        .with(S::Down, E::Remove, S::Removed)
        // Alert
        .with(S::Alert, E::AgentConnected, S::Connecting)
        .with(S::Alert, E::Ping, S::Up)
        .with(S::Alert, E::PingTimeout, S::Alert)
        .with(S::Alert, E::AgentDisconnected, S::Alert)
        .with(S::Alert, E::WaitedTooLong, S::Alert)
        .with(S::Alert, E::ShutdownRequested, S::Disconnected)
        .with(S::Alert, E::HostDown, S::Down)
        .with(S::Alert, E::ManagementServerDown, S::Alert)
        .with(S::Alert, E::Remove, S::Removed)
        // Rebalancing
        .with(S::Rebalancing, E::RebalanceCompleted, S::Connecting)
        .with(S::Rebalancing, E::RebalanceFailed, S::Disconnected)
        .with(S::Rebalancing, E::AgentDisconnected, S::Disconnected)
        .with(S::Rebalancing, E::ManagementServerDown, S::Disconnected)
        .with(S::Rebalancing, E::Remove, S::Removed)
        // Error
        .with(S::Error, E::AgentConnected, S::Connecting)
        .with(S::Error, E::ManagementServerDown, S::Error)
        .with(S::Error, E::Remove, S::Removed)
}
