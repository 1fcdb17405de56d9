//! Error types for membership and partitioning.

use fleet_fsm::TransitionError;
use fleet_state::StateError;
use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transition(#[from] TransitionError<StateError>),

    /// Another run of the same msid took over the heartbeat row.
    #[error("management server {msid} was taken over by run {run_id}")]
    Superseded { msid: u64, run_id: u64 },
}

impl ClusterError {
    /// Store failures abort the current pass; the next tick retries.
    pub fn is_retriable(&self) -> bool {
        match self {
            ClusterError::State(e) => e.is_retriable(),
            ClusterError::Transition(TransitionError::Store(e)) => e.is_retriable(),
            ClusterError::Transition(_) | ClusterError::Superseded { .. } => false,
        }
    }
}
