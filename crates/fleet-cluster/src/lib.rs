//! fleet-cluster: cooperative host ownership across management servers.
//!
//! Every management-server process runs the same two loops against the
//! shared entity store:
//!
//! ```text
//! MembershipManager
//!   └── heartbeat row (msid, run_id, last_update) every `heartbeat.interval`
//!
//! OwnershipPartitioner::pass(now)
//!   1. reclaim   own hosts that lost their agent and went stale
//!   2. sticky    claim unowned hosts in clusters this process already owns
//!   3. adopt     claim whole clusters nobody owns, re-verified under lock
//!   4. reap      fire ManagementServerDown on dead peers' stale hosts
//! ```
//!
//! No host is claimed without the store's write lock, and no cluster is
//! adopted while any of its hosts belongs to someone else.

pub mod error;
pub mod membership;
pub mod partitioner;

pub use error::{ClusterError, ClusterResult};
pub use membership::{Member, MemberStatus, MembershipManager};
pub use partitioner::{OwnershipPartitioner, PartitionReport};
