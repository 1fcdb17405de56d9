//! fleet-fsm: generic optimistic-concurrency state machine.
//!
//! A [`StateMachine`] pairs a [`TransitionTable`] with a [`StateDao`] that
//! persists a transition as a single conditional update. The engine only
//! decides *whether* a transition is legal and *what* the next state is;
//! the DAO decides whether the caller's snapshot is still current.
//!
//! # Outcomes
//!
//! ```text
//! transit(entity, event)
//!   ├── no table entry        → Err(NoTransition)   no store access
//!   ├── DAO matched snapshot  → Ok(true)            version + 1
//!   ├── DAO missed snapshot   → Ok(false)           re-read and re-decide
//!   └── DAO failed            → Err(Store)          retriable
//! ```

pub mod error;
pub mod machine;
pub mod retry;
pub mod table;

pub use error::TransitionError;
pub use machine::{StateDao, StateListener, StateMachine, Stateful};
pub use retry::{retry_transition, Attempt, RetryOutcome};
pub use table::{Symbol, TransitionTable};
