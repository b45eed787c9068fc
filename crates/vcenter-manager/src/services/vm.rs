//! VM service: mirrors hypervisor VMs into the store and the controller.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vcm_common::{PortRef, VcmResult, VmHandle, VmProperties, VM_SUBSCRIPTION_FILTERS};
use vcm_types::{MacAddress, PowerState, ToolsStatus};

use super::{ignore_not_found, upsert_vm, Clients, Settings, SyncState};
use crate::models::{
    interfaces_of, PendingDelete, PendingInterface, RemovalMode, RemovedVm,
    VirtualMachineInterfaceModel, VirtualMachineModel,
};

/// Tracks VMs on the local host.
#[derive(Clone)]
pub struct VmService {
    clients: Clients,
    settings: Arc<Settings>,
}

impl VmService {
    pub fn new(clients: Clients, settings: Arc<Settings>) -> Self {
        Self { clients, settings }
    }

    /// UUID of a VM this manager mirrors, or `None` for VMs it ignores:
    /// VMs still being created, templates and dataplane agent VMs.
    fn managed_uuid(&self, props: &VmProperties) -> Option<Uuid> {
        if props.is_template || props.name.starts_with(&self.settings.agent_vm_prefix) {
            return None;
        }
        props.uuid
    }

    /// Reads a VM and brings the store in line with it.
    ///
    /// Returns the VM's UUID when it is tracked afterwards.
    #[instrument(skip(self, state), fields(vm = %handle))]
    pub async fn observe(
        &self,
        state: &mut SyncState,
        handle: &VmHandle,
    ) -> VcmResult<Option<Uuid>> {
        let props = self.clients.hypervisor.read_properties(handle).await?;
        let Some(uuid) = self.managed_uuid(&props) else {
            debug!(name = %props.name, "ignoring VM");
            return Ok(None);
        };

        if props.host != self.settings.local_host {
            if state.db.get_vm(&uuid).is_some() {
                info!(name = %props.name, host = %props.host, "VM left this host");
                self.forget(state, &uuid, RemovalMode::LocalOnly).await?;
            }
            return Ok(None);
        }

        match state.db.get_vm(&uuid).cloned() {
            None => self.create(state, uuid, handle, &props).await?,
            Some(existing) => self.refresh(state, existing, handle, &props).await?,
        }
        Ok(Some(uuid))
    }

    async fn create(
        &self,
        state: &mut SyncState,
        uuid: Uuid,
        handle: &VmHandle,
        props: &VmProperties,
    ) -> VcmResult<()> {
        let project = state.project()?;
        let mut vm = VirtualMachineModel::from_properties(uuid, handle.clone(), props);

        upsert_vm(self.clients.controller.as_ref(), &vm.to_controller(project.project)).await?;
        vm.subscription = Some(
            self.clients
                .hypervisor
                .subscribe(handle, VM_SUBSCRIPTION_FILTERS)
                .await?,
        );

        for (mac, port) in &vm.interfaces {
            enqueue_reconfigure(state, uuid, *mac, port.clone());
        }

        info!(
            name = %vm.name,
            %uuid,
            interfaces = vm.interfaces.len(),
            "Added VM"
        );
        state.db.save(vm);
        Ok(())
    }

    async fn refresh(
        &self,
        state: &mut SyncState,
        mut vm: VirtualMachineModel,
        handle: &VmHandle,
        props: &VmProperties,
    ) -> VcmResult<()> {
        let renamed = vm.name != props.name;
        let old_power = vm.power_state;

        vm.name = props.name.clone();
        vm.handle = handle.clone();
        vm.host = props.host.clone();
        vm.tools_running = props.tools_status.is_running();
        vm.interfaces = interfaces_of(props);

        let mut push_names = false;
        if renamed {
            rename_interfaces(state, &vm);
            if !self.name_owned_elsewhere(&vm.uuid, &vm.name).await? {
                let project = state.project()?;
                upsert_vm(self.clients.controller.as_ref(), &vm.to_controller(project.project))
                    .await?;
                push_names = true;
            }
        }

        self.diff_interfaces(state, &vm, push_names);
        let uuid = vm.uuid;
        state.db.save(vm);

        if old_power != props.power_state {
            self.update_power_state(state, handle, props.power_state);
        }

        debug!(%uuid, "Refreshed VM");
        Ok(())
    }

    /// Enqueues deletes for interfaces the VM no longer carries and
    /// reconfigures for NICs without a matching interface (or for every NIC
    /// when `refresh_all` is set).
    fn diff_interfaces(&self, state: &mut SyncState, vm: &VirtualMachineModel, refresh_all: bool) {
        let current: Vec<_> = state
            .db
            .list_by_owner(&vm.uuid)
            .into_iter()
            .cloned()
            .collect();

        for vmi in &current {
            let still_attached = vm
                .interfaces
                .get(&vmi.mac)
                .is_some_and(|port| port.port_group_key == vmi.port.port_group_key);
            if !still_attached {
                info!(vmi = %vmi.uuid, mac = %vmi.mac, "NIC detached, deleting interface");
                enqueue_delete(state, vmi.clone(), RemovalMode::Full);
            }
        }

        for (mac, port) in &vm.interfaces {
            let up_to_date = current
                .iter()
                .any(|vmi| vmi.mac == *mac && vmi.port == *port);
            if refresh_all || !up_to_date {
                enqueue_reconfigure(state, vm.uuid, *mac, port.clone());
            }
        }
    }

    /// Applies a rename announced by an event.
    ///
    /// The local model always follows; the controller only when no VM on
    /// another host owns the new name.
    #[instrument(skip(self, state))]
    pub async fn rename(
        &self,
        state: &mut SyncState,
        old_name: &str,
        new_name: &str,
    ) -> VcmResult<bool> {
        let Some(mut vm) = state.db.get_vm_by_name(old_name).cloned() else {
            debug!("renamed VM is not tracked");
            return Ok(false);
        };

        vm.name = new_name.to_string();
        rename_interfaces(state, &vm);
        state.db.save(vm.clone());

        if self.name_owned_elsewhere(&vm.uuid, new_name).await? {
            return Ok(false);
        }

        let project = state.project()?;
        upsert_vm(self.clients.controller.as_ref(), &vm.to_controller(project.project)).await?;
        for vmi in state.db.list_by_owner(&vm.uuid).into_iter().cloned().collect::<Vec<_>>() {
            enqueue_reconfigure(state, vm.uuid, vmi.mac, vmi.port);
        }

        info!(uuid = %vm.uuid, "Renamed VM");
        Ok(true)
    }

    /// Whether a different VM on another host carries `name`. That VM owns
    /// the name in the controller and a push from here would clobber it.
    async fn name_owned_elsewhere(&self, uuid: &Uuid, name: &str) -> VcmResult<bool> {
        let owners = self.clients.hypervisor.locate_vms_by_name(name).await?;
        let Some(other) = owners
            .iter()
            .find(|other| other.uuid != *uuid && other.host != self.settings.local_host)
        else {
            return Ok(false);
        };
        warn!(
            %uuid,
            other = %other.uuid,
            host = %other.host,
            %name,
            "Name is owned by a VM on another host, not pushing rename"
        );
        Ok(true)
    }

    /// Removes a VM announced as removed by an event.
    ///
    /// A removal event also fires when a VM migrates off this host; if the
    /// inventory still knows the VM, only the local state is dropped.
    #[instrument(skip(self, state))]
    pub async fn remove(&self, state: &mut SyncState, name: &str) -> VcmResult<Option<RemovedVm>> {
        let Some(uuid) = state.db.get_vm_by_name(name).map(|vm| vm.uuid) else {
            debug!("removed VM is not tracked");
            return Ok(None);
        };

        let mode = match self.clients.hypervisor.locate_vm(&uuid).await? {
            Some(host) => {
                info!(%uuid, %host, "VM still exists in the cluster, removing locally only");
                RemovalMode::LocalOnly
            }
            None => RemovalMode::Full,
        };

        self.forget(state, &uuid, mode).await
    }

    /// Drops a VM from the store, cancels its subscription and enqueues
    /// its interfaces for deletion with the same reach.
    async fn forget(
        &self,
        state: &mut SyncState,
        uuid: &Uuid,
        mode: RemovalMode,
    ) -> VcmResult<Option<RemovedVm>> {
        let Some(vm) = state.db.delete_vm(uuid) else {
            return Ok(None);
        };

        if let Some(subscription) = vm.subscription {
            match self.clients.hypervisor.unsubscribe(subscription).await {
                Err(e) if e.is_connection_lost() => return Err(e),
                Err(e) => debug!(error = %e, "failed to cancel subscription"),
                Ok(()) => {}
            }
        }

        for vmi in state.db.list_by_owner(uuid).into_iter().cloned().collect::<Vec<_>>() {
            enqueue_delete(state, vmi, mode);
        }

        info!(name = %vm.name, %uuid, ?mode, "Removed VM");
        Ok(Some(RemovedVm { uuid: *uuid, mode }))
    }

    /// Deletes a VM from the controller. A missing VM counts as deleted.
    #[instrument(skip(self))]
    pub async fn delete_from_controller(&self, uuid: &Uuid) -> VcmResult<()> {
        ignore_not_found(
            self.clients.controller.delete_vm(uuid).await,
            "virtual-machine",
            uuid,
        )?;
        info!("Deleted VM from controller");
        Ok(())
    }

    /// Records a power state change.
    ///
    /// Every interface of the VM gets its dataplane port refreshed so its
    /// admin state follows; on power-on the NICs are also reconfigured,
    /// since their VLAN may have been reassigned while the VM was down.
    pub fn update_power_state(
        &self,
        state: &mut SyncState,
        handle: &VmHandle,
        power_state: PowerState,
    ) -> bool {
        let Some(mut vm) = state.db.get_vm_by_handle(handle).cloned() else {
            return false;
        };
        if vm.power_state == power_state {
            return false;
        }
        vm.power_state = power_state;

        for vmi in state.db.list_by_owner(&vm.uuid).into_iter().cloned().collect::<Vec<_>>() {
            state.db.dataplane_ports_pending_upsert.enqueue(vmi.uuid, ());
        }
        if power_state.is_on() {
            for (mac, port) in &vm.interfaces {
                enqueue_reconfigure(state, vm.uuid, *mac, port.clone());
            }
        }

        info!(uuid = %vm.uuid, %power_state, "VM power state changed");
        state.db.save(vm);
        true
    }

    /// Records the guest tools status.
    pub fn update_tools_running(
        &self,
        state: &mut SyncState,
        handle: &VmHandle,
        status: ToolsStatus,
    ) -> bool {
        let Some(mut vm) = state.db.get_vm_by_handle(handle).cloned() else {
            return false;
        };
        if vm.tools_running == status.is_running() {
            return false;
        }
        vm.tools_running = status.is_running();
        debug!(uuid = %vm.uuid, running = vm.tools_running, "Guest tools status changed");
        state.db.save(vm);
        true
    }

    /// Deletes controller VMs of this project that nothing tracks.
    ///
    /// VMs the inventory places on another host belong to that host's
    /// manager and are left alone.
    #[instrument(skip(self, state))]
    pub async fn sweep(&self, state: &mut SyncState) -> VcmResult<()> {
        let project = state.project()?;
        let vms = self.clients.controller.list_vms(&project.project).await?;

        for vm in vms {
            if state.db.get_vm(&vm.uuid).is_some() {
                continue;
            }
            match self.clients.hypervisor.locate_vm(&vm.uuid).await? {
                Some(host) if host != self.settings.local_host => {
                    debug!(uuid = %vm.uuid, %host, "VM owned by another host");
                }
                Some(_) => debug!(uuid = %vm.uuid, "VM on this host is not managed"),
                None => {
                    info!(uuid = %vm.uuid, name = %vm.name, "Deleting stale VM");
                    self.delete_from_controller(&vm.uuid).await?;
                }
            }
        }
        Ok(())
    }
}

/// Enqueues a NIC for interface reconfiguration, cancelling a pending
/// delete of the same interface.
pub(crate) fn enqueue_reconfigure(
    state: &mut SyncState,
    vm_uuid: Uuid,
    mac: MacAddress,
    port: PortRef,
) {
    let pending = PendingInterface { vm_uuid, mac, port };
    let key = pending.key();
    state.db.interfaces_pending_delete.complete(&key);
    state.db.interfaces_pending_reconfigure.enqueue(key, pending);
}

/// Enqueues an interface for deletion, cancelling a pending reconfigure.
pub(crate) fn enqueue_delete(
    state: &mut SyncState,
    vmi: VirtualMachineInterfaceModel,
    mode: RemovalMode,
) {
    state.db.interfaces_pending_reconfigure.complete(&vmi.uuid);
    state
        .db
        .interfaces_pending_delete
        .enqueue(vmi.uuid, PendingDelete { vmi, mode });
}

/// Propagates a VM's new name to its interfaces in the store.
fn rename_interfaces(state: &mut SyncState, vm: &VirtualMachineModel) {
    for mut vmi in state.db.list_by_owner(&vm.uuid).into_iter().cloned().collect::<Vec<_>>() {
        vmi.rename_vm(&vm.name);
        state.db.save(vmi);
    }
}
