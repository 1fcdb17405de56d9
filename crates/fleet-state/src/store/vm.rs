//! VM rows and the VM lifecycle conditional update.

use fleet_fsm::StateDao;
use tracing::debug;

use super::{StateStore, get_row, next_id, put_row, scan};
use crate::error::{StateError, StateResult};
use crate::tables::VMS;
use crate::types::*;
use crate::vm_state::{VmEvent, VmState};

/// Target of a VM transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmTransitionContext {
    /// Host to record on success. Ignored when the target state holds no host.
    pub new_host_id: Option<HostId>,
    /// Unix seconds.
    pub now: u64,
    /// Clear network identity in the same write (administrative removal).
    pub scrub_network: bool,
}

impl VmTransitionContext {
    pub fn on_host(host_id: Option<HostId>, now: u64) -> Self {
        Self {
            new_host_id: host_id,
            now,
            scrub_network: false,
        }
    }

    /// Context for `Destroy` issued by an administrative removal.
    pub fn removal(now: u64) -> Self {
        Self {
            new_host_id: None,
            now,
            scrub_network: true,
        }
    }
}

impl StateStore {
    /// Record a provisioning request. The VM starts in `Creating` with no host.
    pub fn create_vm(&self, new: NewVm, now: u64) -> StateResult<VirtualMachine> {
        let vm = self.write(|txn| {
            let vm = VirtualMachine {
                id: next_id(txn, "vm")?,
                name: new.name,
                state: VmState::Creating,
                host_id: None,
                last_host_id: None,
                cleanup_host_id: None,
                private_ip: new.private_ip,
                private_mac: new.private_mac,
                details: new.details,
                updated: 0,
                created: now,
                update_time: now,
                removed: None,
            };
            let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            put_row(&mut vms, vm.id, &vm)?;
            Ok(vm)
        })?;
        debug!(vm_id = vm.id, vm_type = ?vm.vm_type(), "vm created");
        Ok(vm)
    }

    pub fn get_vm(&self, id: VmId) -> StateResult<Option<VirtualMachine>> {
        self.read(|txn| {
            let vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            get_row(&vms, id)
        })
    }

    pub fn require_vm(&self, id: VmId) -> StateResult<VirtualMachine> {
        self.get_vm(id)?
            .ok_or_else(|| StateError::NotFound(format!("vm {id}")))
    }

    pub fn list_vms(&self) -> StateResult<Vec<VirtualMachine>> {
        self.select_vms(|_| true)
    }

    /// VMs currently placed on `host_id`.
    pub fn list_vms_by_host(&self, host_id: HostId) -> StateResult<Vec<VirtualMachine>> {
        self.select_vms(|vm| vm.host_id == Some(host_id))
    }

    /// VMs whose last successful run was on `host_id`.
    pub fn list_vms_by_last_host(&self, host_id: HostId) -> StateResult<Vec<VirtualMachine>> {
        self.select_vms(|vm| vm.last_host_id == Some(host_id))
    }

    pub fn list_vms_in_states(&self, states: &[VmState]) -> StateResult<Vec<VirtualMachine>> {
        self.select_vms(|vm| states.contains(&vm.state))
    }

    /// Physically delete expunging VMs. Other ids are left in place.
    /// Returns the number of rows removed.
    pub fn delete_vms(&self, ids: &[VmId]) -> StateResult<usize> {
        let deleted = self.write(|txn| {
            let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            let mut deleted = 0;
            for &id in ids {
                let expunging = get_row::<VirtualMachine>(&vms, id)?
                    .is_some_and(|vm| vm.state == VmState::Expunging);
                if expunging {
                    vms.remove(id).map_err(map_err!(Write))?;
                    deleted += 1;
                }
            }
            Ok(deleted)
        })?;
        debug!(deleted, requested = ids.len(), "vms reaped");
        Ok(deleted)
    }

    fn select_vms(
        &self,
        keep: impl FnMut(&VirtualMachine) -> bool,
    ) -> StateResult<Vec<VirtualMachine>> {
        self.read(|txn| {
            let vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            scan(&vms, keep)
        })
    }
}

/// VM lifecycle update.
///
/// Matches on id, state, `host_id` and `updated`. Host fields follow the
/// target state: states that hold no host clear `host_id`, `Running` stamps
/// `last_host_id`, `Expunging` clears it and keeps the host as
/// `cleanup_host_id` until the row is deleted.
impl StateDao<VmState, VmEvent> for StateStore {
    type Entity = VirtualMachine;
    type Context = VmTransitionContext;
    type Error = StateError;

    fn update_state(
        &self,
        current: VmState,
        _event: VmEvent,
        next: VmState,
        vm: &VirtualMachine,
        ctx: &VmTransitionContext,
    ) -> StateResult<bool> {
        self.write(|txn| {
            let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            let Some(mut row) = get_row::<VirtualMachine>(&vms, vm.id)? else {
                return Ok(false);
            };
            if row.state != current || row.host_id != vm.host_id || row.updated != vm.updated {
                return Ok(false);
            }

            row.state = next;
            row.host_id = if next.holds_host() { ctx.new_host_id } else { None };
            if next.stamps_last_host() && row.host_id.is_some() {
                row.last_host_id = row.host_id;
            }
            if next.clears_last_host() {
                row.cleanup_host_id = row.last_host_id.or(row.cleanup_host_id);
                row.last_host_id = None;
            }
            row.removed = match next {
                VmState::Destroyed | VmState::Expunging => row.removed.or(Some(ctx.now)),
                _ => None,
            };
            if ctx.scrub_network {
                row.private_ip = None;
                row.private_mac = None;
                row.details.scrub_addresses();
            }
            row.updated += 1;
            row.update_time = ctx.now;
            put_row(&mut vms, row.id, &row)?;
            Ok(true)
        })
    }
}
