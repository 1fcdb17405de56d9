//! Domain records for the fleet entity store.
//!
//! These types are the persisted rows for hosts, clusters, virtual machines
//! and management-server heartbeats. All are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};

use crate::resource::ResourceState;
use crate::status::Status;
use crate::vm_state::VmState;

/// Unique identifier for a host.
pub type HostId = u64;

/// Unique identifier for a cluster.
pub type ClusterId = u64;

/// Unique identifier for a virtual machine.
pub type VmId = u64;

/// Opaque id of a management-server process.
pub type Msid = u64;

// ── Host ──────────────────────────────────────────────────────────

/// What kind of agent runs on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostType {
    Routing,
    Storage,
    SecondaryStorage,
    ConsoleProxy,
}

/// A physical or hypervisor host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    /// Stable hardware/agent identity.
    pub guid: String,
    pub name: String,
    pub host_type: HostType,
    pub hypervisor: String,
    pub private_ip: Option<String>,
    pub cluster_id: ClusterId,
    /// Connectivity state.
    pub status: Status,
    /// Administrative state, versioned independently of `status`.
    pub resource_state: ResourceState,
    /// Owning management server, `None` if unowned.
    pub management_server_id: Option<Msid>,
    /// Unix seconds of the last liveness signal.
    pub last_pinged: u64,
    /// CAS token, incremented on every successful conditional update.
    pub updated: u64,
    pub created: u64,
    /// Soft-delete timestamp; removed hosts are never reused.
    pub removed: Option<u64>,
}

/// Registration data for a new host.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHost {
    pub guid: String,
    pub name: String,
    pub host_type: HostType,
    pub hypervisor: String,
    pub private_ip: Option<String>,
    pub cluster_id: ClusterId,
}

impl Host {
    pub fn is_removed(&self) -> bool {
        self.removed.is_some()
    }

    pub fn is_owned_by(&self, msid: Msid) -> bool {
        self.management_server_id == Some(msid)
    }

    /// Owned by some process other than `msid`.
    pub fn is_owned_by_other(&self, msid: Msid) -> bool {
        self.management_server_id.is_some_and(|owner| owner != msid)
    }
}

// ── Cluster ───────────────────────────────────────────────────────

/// Whether a cluster takes part in ownership partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagedState {
    Managed,
    Unmanaged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub managed_state: ManagedState,
    pub created: u64,
}

impl Cluster {
    pub fn is_managed(&self) -> bool {
        self.managed_state == ManagedState::Managed
    }
}

// ── Virtual machine ───────────────────────────────────────────────

/// VM subtype discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmType {
    User,
    DomainRouter,
    ConsoleProxy,
    SecondaryStorageVm,
}

/// Role of a secondary-storage VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SsvmRole {
    Templates,
    CommandExecutor,
}

/// Subtype-specific extension record. The lifecycle never reads these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VmDetails {
    User {
        display_name: String,
        ha_enabled: bool,
    },
    DomainRouter {
        public_ip: Option<String>,
        guest_ip: Option<String>,
        redundant: bool,
    },
    ConsoleProxy {
        public_ip: Option<String>,
        active_sessions: u32,
    },
    SecondaryStorageVm {
        public_ip: Option<String>,
        role: SsvmRole,
    },
}

impl VmDetails {
    pub fn vm_type(&self) -> VmType {
        match self {
            VmDetails::User { .. } => VmType::User,
            VmDetails::DomainRouter { .. } => VmType::DomainRouter,
            VmDetails::ConsoleProxy { .. } => VmType::ConsoleProxy,
            VmDetails::SecondaryStorageVm { .. } => VmType::SecondaryStorageVm,
        }
    }

    /// Clear subtype network identity (public/guest addresses).
    pub fn scrub_addresses(&mut self) {
        match self {
            VmDetails::User { .. } => {}
            VmDetails::DomainRouter {
                public_ip,
                guest_ip,
                ..
            } => {
                *public_ip = None;
                *guest_ip = None;
            }
            VmDetails::ConsoleProxy { public_ip, .. }
            | VmDetails::SecondaryStorageVm { public_ip, .. } => *public_ip = None,
        }
    }
}

/// A virtual machine of any subtype.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualMachine {
    pub id: VmId,
    pub name: String,
    pub state: VmState,
    /// Host currently running the instance.
    pub host_id: Option<HostId>,
    /// Last host the instance successfully ran on.
    pub last_host_id: Option<HostId>,
    /// Host that still has to clean up an expunging instance.
    #[serde(default)]
    pub cleanup_host_id: Option<HostId>,
    pub private_ip: Option<String>,
    pub private_mac: Option<String>,
    pub details: VmDetails,
    /// CAS token, incremented on every successful conditional update.
    pub updated: u64,
    pub created: u64,
    /// Unix seconds of the last committed transition.
    pub update_time: u64,
    pub removed: Option<u64>,
}

/// Provisioning request for a new VM.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVm {
    pub name: String,
    pub details: VmDetails,
    pub private_ip: Option<String>,
    pub private_mac: Option<String>,
}

impl VirtualMachine {
    pub fn vm_type(&self) -> VmType {
        self.details.vm_type()
    }
}

// ── Management server ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsState {
    Up,
    Down,
}

/// Liveness heartbeat row of a management-server process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagementServerHost {
    pub msid: Msid,
    pub name: String,
    pub state: MsState,
    /// Distinguishes restarts of the same msid.
    pub run_id: u64,
    /// Unix seconds of the last heartbeat.
    pub last_update: u64,
    pub joined: u64,
}
