//! fleet-state: the shared entity store for the fleet control plane.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the authoritative rows for
//! hosts, clusters, virtual machines and management-server heartbeats, and
//! the three state machines that govern them:
//!
//! - [`host_status_machine`]: connectivity (`Up`, `Down`, `Alert`, ...)
//! - [`resource_state_machine`]: administrative intent (`Enabled`, `Maintenance`, ...)
//! - [`vm_machine`]: VM lifecycle, shared by every VM subtype
//!
//! # Concurrency
//!
//! redb serializes write transactions, so every conditional update reads the
//! row and writes it back inside one write transaction. A row that no longer
//! matches the caller's snapshot is left untouched and the update reports
//! `false`. Several threads sharing one [`StateStore`] behave like several
//! management servers sharing one database.

pub mod error;
pub mod resource;
pub mod status;
pub mod store;
pub mod tables;
pub mod types;
pub mod vm_state;

pub use error::{StateError, StateResult};
pub use resource::{ResourceEvent, ResourceState, resource_state_machine};
pub use status::{HostEvent, Status, host_status_machine};
pub use store::{AdoptOutcome, HostTransitionContext, StateStore, VmTransitionContext};
pub use types::*;
pub use vm_state::{VmEvent, VmState, vm_machine};
