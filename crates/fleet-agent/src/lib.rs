//! fleet-agent: supervision of the hosts this process owns.
//!
//! The ownership partitioner decides which hosts belong to this process;
//! the [`HostSupervisor`] talks to their agents through an [`AgentDriver`]
//! and turns what it hears into host status transitions.
//!
//! ```text
//! HostSupervisor::poll_once(now)
//!   ├── owned, not Up          → CheckHealth → AgentConnected, Ready
//!   ├── owned, Up              → CheckHealth every ping_interval → Ping
//!   └── ping older than ping_interval × multiplier → PingTimeout
//! ```
//!
//! Every handler is a bounded re-read / re-decide loop: a lost race re-reads
//! the host and tries again, up to `max_retries` times.

pub mod driver;
pub mod error;
pub mod supervisor;

pub use driver::{AgentDriver, Answer, BoxFuture, Command, DriverError, SimulatedDriver};
pub use error::{SupervisorError, SupervisorResult};
pub use supervisor::{HostSupervisor, PollReport};
