//! Error types for the host supervisor.

use fleet_fsm::TransitionError;
use fleet_state::{HostId, Msid, StateError, VmId};
use thiserror::Error;

use crate::driver::DriverError;

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transition(#[from] TransitionError<StateError>),

    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The host belongs to another management server.
    #[error("host {host_id} is owned by management server {owner}")]
    NotOwner { host_id: HostId, owner: Msid },

    /// Every attempt lost its race.
    #[error("host {host_id}: gave up after {attempts} conflicting updates")]
    Contended { host_id: HostId, attempts: u32 },

    /// Maintenance cannot complete while VMs are still placed on the host.
    #[error("host {host_id} still runs {} vm(s)", vms.len())]
    HostBusy { host_id: HostId, vms: Vec<VmId> },
}

impl SupervisorError {
    pub fn is_retriable(&self) -> bool {
        match self {
            SupervisorError::State(e) => e.is_retriable(),
            SupervisorError::Transition(TransitionError::Store(e)) => e.is_retriable(),
            SupervisorError::Transition(_) => false,
            SupervisorError::Driver(_) | SupervisorError::Contended { .. } => true,
            SupervisorError::NotOwner { .. } | SupervisorError::HostBusy { .. } => false,
        }
    }

    /// The store itself failed, as opposed to a per-host refusal.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            SupervisorError::State(_) | SupervisorError::Transition(TransitionError::Store(_))
        )
    }
}
