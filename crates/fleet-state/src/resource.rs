//! Host administrative (resource) state machine.
//!
//! Orthogonal to connectivity: its conditional update keys on
//! `resource_state` alone and never touches `status` or `updated`.

use std::fmt;
use std::sync::OnceLock;

use fleet_fsm::{StateMachine, Stateful, TransitionTable};
use serde::{Deserialize, Serialize};

use crate::types::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Creating,
    Enabled,
    Disabled,
    PrepareForMaintenance,
    ErrorInPrepareForMaintenance,
    Maintenance,
    ErrorInMaintenance,
    Error,
}

impl ResourceState {
    /// Hosts in these states accept new workloads.
    pub fn is_schedulable(self) -> bool {
        self == ResourceState::Enabled
    }

    pub fn is_maintenance_family(self) -> bool {
        matches!(
            self,
            ResourceState::PrepareForMaintenance
                | ResourceState::ErrorInPrepareForMaintenance
                | ResourceState::Maintenance
                | ResourceState::ErrorInMaintenance
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceEvent {
    InternalCreated,
    Enable,
    Disable,
    AdminAskMaintenance,
    InternalEnterMaintenance,
    AdminCancelMaintenance,
    UnableToMigrate,
    UnableToMaintain,
    ErrorsCorrected,
    Error,
    DeleteHost,
}

impl fmt::Display for ResourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Stateful<ResourceState> for Host {
    fn current_state(&self) -> ResourceState {
        self.resource_state
    }
}

pub type ResourceStateMachine = StateMachine<ResourceState, ResourceEvent, Host>;

pub fn resource_state_machine() -> &'static ResourceStateMachine {
    static MACHINE: OnceLock<ResourceStateMachine> = OnceLock::new();
    MACHINE.get_or_init(|| StateMachine::new("host-resource-state", resource_table()))
}

fn resource_table() -> TransitionTable<ResourceState, ResourceEvent> {
    use ResourceEvent as E;
    use ResourceState as S;

    TransitionTable::new()
        .with(S::Creating, E::InternalCreated, S::Enabled)
        .with(S::Creating, E::Error, S::Error)
        // Enabled
        .with(S::Enabled, E::Enable, S::Enabled)
        .with(S::Enabled, E::InternalCreated, S::Enabled)
        .with(S::Enabled, E::Disable, S::Disabled)
        .with(S::Enabled, E::AdminAskMaintenance, S::PrepareForMaintenance)
        .with(S::Enabled, E::InternalEnterMaintenance, S::Maintenance)
        .with(S::Enabled, E::Error, S::Error)
        .with(S::Enabled, E::DeleteHost, S::Disabled)
        // Disabled
        .with(S::Disabled, E::Enable, S::Enabled)
        .with(S::Disabled, E::Disable, S::Disabled)
        .with(S::Disabled, E::InternalCreated, S::Disabled)
        .with(S::Disabled, E::AdminAskMaintenance, S::PrepareForMaintenance)
        .with(S::Disabled, E::InternalEnterMaintenance, S::Maintenance)
        .with(S::Disabled, E::DeleteHost, S::Disabled)
        // PrepareForMaintenance
        .with(S::PrepareForMaintenance, E::InternalEnterMaintenance, S::Maintenance)
        .with(S::PrepareForMaintenance, E::AdminCancelMaintenance, S::Enabled)
        .with(S::PrepareForMaintenance, E::UnableToMigrate, S::ErrorInPrepareForMaintenance)
        .with(S::PrepareForMaintenance, E::UnableToMaintain, S::ErrorInMaintenance)
        .with(S::PrepareForMaintenance, E::InternalCreated, S::PrepareForMaintenance)
        // ErrorInPrepareForMaintenance
        .with(S::ErrorInPrepareForMaintenance, E::InternalEnterMaintenance, S::Maintenance)
        .with(S::ErrorInPrepareForMaintenance, E::AdminCancelMaintenance, S::Enabled)
        .with(S::ErrorInPrepareForMaintenance, E::ErrorsCorrected, S::PrepareForMaintenance)
        .with(S::ErrorInPrepareForMaintenance, E::InternalCreated, S::ErrorInPrepareForMaintenance)
        // Maintenance
        .with(S::Maintenance, E::AdminCancelMaintenance, S::Enabled)
        .with(S::Maintenance, E::InternalCreated, S::Maintenance)
        .with(S::Maintenance, E::DeleteHost, S::Disabled)
        // ErrorInMaintenance
        .with(S::ErrorInMaintenance, E::InternalCreated, S::ErrorInMaintenance)
        .with(S::ErrorInMaintenance, E::InternalEnterMaintenance, S::Maintenance)
        .with(S::ErrorInMaintenance, E::AdminCancelMaintenance, S::Enabled)
        .with(S::ErrorInMaintenance, E::ErrorsCorrected, S::Maintenance)
        .with(S::ErrorInMaintenance, E::Disable, S::Disabled)
        .with(S::ErrorInMaintenance, E::DeleteHost, S::Disabled)
        // Error
        .with(S::Error, E::InternalCreated, S::Error)
        .with(S::Error, E::ErrorsCorrected, S::Enabled)
        .with(S::Error, E::Disable, S::Disabled)
        .with(S::Error, E::DeleteHost, S::Disabled)
}
