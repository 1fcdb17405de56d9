//! Transition error types.

use thiserror::Error;

/// Errors from a transition attempt.
///
/// A lost race is not an error; it is `Ok(false)` from
/// [`StateMachine::transit`](crate::StateMachine::transit).
#[derive(Debug, Error)]
pub enum TransitionError<E> {
    /// The table has no entry for `(state, event)`. Ordering bug, never retried.
    #[error("{machine}: no transition from {state} on {event}")]
    NoTransition {
        machine: &'static str,
        state: String,
        event: String,
    },

    #[error("store error: {0}")]
    Store(#[source] E),
}

impl<E> TransitionError<E> {
    /// Whether the caller's control loop should try again on its next tick.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransitionError::Store(_))
    }

    pub fn is_no_transition(&self) -> bool {
        matches!(self, TransitionError::NoTransition { .. })
    }
}
