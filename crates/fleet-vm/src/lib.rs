//! fleet-vm: the VM lifecycle coordinator.
//!
//! Every VM subtype shares one lifecycle. The coordinator turns user
//! requests (start, stop, migrate, remove, expunge) and agent power reports
//! into transitions on the VM row, and sends the matching command to the
//! host agent between the "in progress" and "done" transitions:
//!
//! ```text
//! start:   Stopped ─Start→ Starting ─(StartVm ok)→ Running
//!                                   └(failed)────→ Stopped
//! stop:    Running ─Stop→ Stopping ─(StopVm ok)→ Stopped
//! migrate: Running ─Migrate→ Migrating ─(MigrateVm)→ Running on destination
//! ```
//!
//! A request that does not apply to the VM's current state is rejected with
//! that state rather than treated as a fault.

pub mod coordinator;
pub mod error;

pub use coordinator::{PowerReport, VmCoordinator};
pub use error::{LifecycleError, LifecycleResult};
