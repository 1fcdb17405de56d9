//! Lifecycle error types.

use fleet_agent::DriverError;
use fleet_fsm::TransitionError;
use fleet_state::{HostId, StateError, VmEvent, VmId, VmState};
use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The request does not apply to the VM's current state.
    #[error("vm {id} is {state}; {event} not allowed")]
    Rejected {
        id: VmId,
        state: VmState,
        event: VmEvent,
    },

    #[error("vm not found: {0}")]
    NotFound(VmId),

    #[error("vm {0} has no host to start on")]
    NoHost(VmId),

    #[error("host {host_id} cannot take vms: {reason}")]
    HostUnavailable { host_id: HostId, reason: String },

    /// The agent answered but refused the command.
    #[error("vm {vm_id}: host {host_id} refused command: {details}")]
    CommandFailed {
        vm_id: VmId,
        host_id: HostId,
        details: String,
    },

    #[error("vm {vm_id}: gave up after {attempts} conflicting updates")]
    Contended { vm_id: VmId, attempts: u32 },

    #[error(transparent)]
    Transition(#[from] TransitionError<StateError>),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl LifecycleError {
    pub fn is_retriable(&self) -> bool {
        match self {
            LifecycleError::State(e) => e.is_retriable(),
            LifecycleError::Transition(TransitionError::Store(e)) => e.is_retriable(),
            LifecycleError::Driver(_) | LifecycleError::Contended { .. } => true,
            _ => false,
        }
    }
}
