//! redb table definitions for the fleet entity store.
//!
//! Entity tables use `u64` ids and `&[u8]` values (JSON-serialized records).
//! Every entity row carries its own `updated` version counter; the tables
//! themselves are plain key/value maps.

use redb::TableDefinition;

/// Hosts keyed by host id.
pub const HOSTS: TableDefinition<u64, &[u8]> = TableDefinition::new("hosts");

/// Clusters keyed by cluster id.
pub const CLUSTERS: TableDefinition<u64, &[u8]> = TableDefinition::new("clusters");

/// Virtual machines (all subtypes) keyed by VM id.
pub const VMS: TableDefinition<u64, &[u8]> = TableDefinition::new("vms");

/// Management-server heartbeat rows keyed by msid.
pub const MSHOSTS: TableDefinition<u64, &[u8]> = TableDefinition::new("mshosts");

/// Id sequences keyed by entity kind (`"host"`, `"cluster"`, `"vm"`).
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
