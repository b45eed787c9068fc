//! Virtual machine interface service.
//!
//! Drains the two interface queues: NICs waiting to be created or
//! refreshed, and interfaces waiting to be deleted. Owns the VLAN override
//! on each managed switch port.

use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use vcm_common::{ControllerApi, ControllerInstanceIp, PortRef, VcmError, VcmResult};
use vcm_types::{ids, MacAddress};

use super::{drain_error, ignore_not_found, upsert_interface, Clients, Settings, SyncState, VnService};
use crate::models::{
    PendingDelete, PendingInterface, RemovalMode, VirtualMachineInterfaceModel,
    VirtualNetworkModel,
};

/// Reconciles interfaces with the controller and the hypervisor.
#[derive(Clone)]
pub struct VmiService {
    clients: Clients,
    settings: Arc<Settings>,
    vn: VnService,
}

impl VmiService {
    pub fn new(clients: Clients, settings: Arc<Settings>, vn: VnService) -> Self {
        Self {
            clients,
            settings,
            vn,
        }
    }

    /// Drains pending deletes, then pending reconfigures.
    ///
    /// An entry leaves its queue only once its work is done or has failed
    /// for a reason retrying cannot fix. A lost connection aborts the drain
    /// and leaves the remaining entries queued.
    pub async fn reconcile_pending(&self, state: &mut SyncState) -> VcmResult<()> {
        for (key, pending) in state.db.interfaces_pending_delete.snapshot() {
            if let Err(e) = self.delete(state, &pending).await {
                drain_error("interface delete", &key, e)?;
            }
            state.db.interfaces_pending_delete.complete(&key);
        }

        for (key, pending) in state.db.interfaces_pending_reconfigure.snapshot() {
            if let Err(e) = self.reconfigure(state, &pending).await {
                drain_error("interface reconfigure", &key, e)?;
            }
            state.db.interfaces_pending_reconfigure.complete(&key);
        }

        Ok(())
    }

    /// Creates or refreshes the interface of one NIC.
    #[instrument(skip(self, state, pending), fields(vm = %pending.vm_uuid, mac = %pending.mac))]
    async fn reconfigure(&self, state: &mut SyncState, pending: &PendingInterface) -> VcmResult<()> {
        let Some(vm) = state.db.get_vm(&pending.vm_uuid).cloned() else {
            debug!("VM no longer tracked");
            return Ok(());
        };
        if vm.interfaces.get(&pending.mac) != Some(&pending.port) {
            debug!("NIC no longer attached to this port");
            return Ok(());
        }

        let Some(vn_uuid) = self
            .vn
            .resolve_for_key(state, &pending.port.port_group_key)
            .await?
        else {
            info!(port_group = %pending.port.port_group_key, "Network not managed, skipping NIC");
            return Ok(());
        };
        let vn = state
            .db
            .get_vn(&vn_uuid)
            .cloned()
            .ok_or_else(|| VcmError::internal(format!("network {} vanished from store", vn_uuid)))?;

        let uuid = ids::interface_uuid(&vm.uuid, &vn.uuid);
        let mut vmi = match state.db.get_vmi(&uuid).cloned() {
            Some(mut existing) => {
                if existing.mac != pending.mac {
                    info!(vmi = %uuid, old_mac = %existing.mac, "Interface moved to another NIC");
                    existing.mac = pending.mac;
                }
                if existing.port != pending.port {
                    if existing.vlan_id.is_some() {
                        self.restore_default_vlan(&existing.port).await?;
                    }
                    existing.port = pending.port.clone();
                }
                existing.vn_name = vn.name.clone();
                existing.vn_controller_uuid = vn.controller_uuid;
                existing.rename_vm(&vm.name);
                existing
            }
            None => VirtualMachineInterfaceModel::new(&vm, &vn, pending.mac, pending.port.clone()),
        };

        match self.assign_vlan(state, &mut vmi).await {
            Ok(()) => {}
            Err(VcmError::VlanPoolExhausted { start, end }) => {
                error!(vmi = %uuid, start, end, "VLAN pool exhausted, interface left unmanaged");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let project = state.project()?;
        upsert_interface(
            self.clients.controller.as_ref(),
            &vmi.to_controller(project.project, Some(project.security_group)),
        )
        .await?;
        self.sync_instance_ip(&vn, &mut vmi).await?;

        info!(
            vmi = %vmi.uuid,
            name = %vmi.display_name,
            vlan = ?vmi.vlan_id.map(|v| v.as_u16()),
            "Reconfigured interface"
        );
        state.db.dataplane_ports_pending_delete.complete(&vmi.uuid);
        state.db.dataplane_ports_pending_upsert.enqueue(vmi.uuid, ());
        state.db.save(vmi);
        Ok(())
    }

    /// Settles the VLAN override of the interface's port.
    ///
    /// A tag already configured on the port is kept unless another
    /// interface holds it: rewriting a correct tag interrupts traffic. A
    /// tag reserved only by the host scan counts as this port's own, since
    /// the scan saw it on this very port. Otherwise the interface's
    /// previous tag is restored, or the lowest free tag is allocated, and
    /// pushed to the port.
    async fn assign_vlan(
        &self,
        state: &mut SyncState,
        vmi: &mut VirtualMachineInterfaceModel,
    ) -> VcmResult<()> {
        let current = self.clients.hypervisor.get_vlan(&vmi.port).await?;
        let previous = vmi.vlan_id;
        let contested =
            current.is_some_and(|tag| state.vlan_held_by_other(&vmi.vn_uuid, &vmi.uuid, tag));
        let pool = state.pool_for(&vmi.vn_uuid);

        if let Some(tag) = current {
            if previous == Some(tag) || !contested {
                pool.reserve(tag);
                if let Some(old) = previous.filter(|old| *old != tag) {
                    pool.free(old);
                }
                vmi.vlan_id = Some(tag);
                debug!(vlan = %tag, "keeping VLAN configured on port");
                return Ok(());
            }
            debug!(vlan = %tag, "VLAN on port is held by another interface");
        }

        let id = match previous {
            Some(old) => {
                pool.reserve(old);
                old
            }
            None => pool.get_available()?,
        };

        if let Err(e) = self.clients.hypervisor.set_vlan(&vmi.port, Some(id)).await {
            if previous.is_none() {
                state.pool_for(&vmi.vn_uuid).free(id);
            }
            return Err(e);
        }
        info!(port = %vmi.port, vlan = %id, "Set VLAN override");
        vmi.vlan_id = Some(id);
        Ok(())
    }

    /// Makes sure the interface has its instance IP.
    ///
    /// With the controller's IPAM the controller allocates the address,
    /// which is recorded on the interface. With an external IPAM the
    /// address is whatever the guest reports, once it reports one.
    async fn sync_instance_ip(
        &self,
        vn: &VirtualNetworkModel,
        vmi: &mut VirtualMachineInterfaceModel,
    ) -> VcmResult<()> {
        let controller = self.clients.controller.as_ref();
        let uuid = ids::instance_ip_uuid(&vmi.uuid);
        let mut desired = ControllerInstanceIp {
            uuid,
            vmi_uuid: vmi.uuid,
            vn_uuid: vn.controller_uuid,
            address: None,
        };

        let iip = if vn.external_ipam {
            let Some(ip) = vmi.ip_address else {
                debug!(vmi = %vmi.uuid, "waiting for guest to report an address");
                return Ok(());
            };
            desired.address = Some(ip);
            match controller.update_instance_ip(&desired).await {
                Err(e) if e.is_not_found() => create_instance_ip(controller, &desired).await?,
                other => other?,
            }
        } else {
            match controller.read_instance_ip(&uuid).await? {
                Some(existing) => existing,
                None => create_instance_ip(controller, &desired).await?,
            }
        };

        vmi.ip_address = iip.address;
        vmi.instance_ip_uuid = Some(uuid);
        Ok(())
    }

    /// Deletes one interface.
    ///
    /// A full delete removes the instance IP and the interface from the
    /// controller and restores the port's default VLAN. A local-only
    /// delete just releases the reservation. Both drop the dataplane port.
    #[instrument(skip(self, state, pending), fields(vmi = %pending.vmi.uuid, mode = ?pending.mode))]
    async fn delete(&self, state: &mut SyncState, pending: &PendingDelete) -> VcmResult<()> {
        let vmi = &pending.vmi;

        if pending.mode == RemovalMode::Full {
            let controller = self.clients.controller.as_ref();
            let iip = vmi
                .instance_ip_uuid
                .unwrap_or_else(|| ids::instance_ip_uuid(&vmi.uuid));
            ignore_not_found(controller.delete_instance_ip(&iip).await, "instance-ip", &iip)?;
            ignore_not_found(
                controller.delete_interface(&vmi.uuid).await,
                "virtual-machine-interface",
                &vmi.uuid,
            )?;

            if vmi.vlan_id.is_some() {
                self.restore_default_vlan(&vmi.port).await?;
            }
        }

        if let Some(id) = vmi.vlan_id {
            state.pool_for(&vmi.vn_uuid).free(id);
        }
        state.db.delete_vmi(&vmi.uuid);
        state.db.dataplane_ports_pending_upsert.complete(&vmi.uuid);
        state.db.dataplane_ports_pending_delete.enqueue(vmi.uuid, ());

        info!(name = %vmi.display_name, "Deleted interface");
        Ok(())
    }

    /// Clears the VLAN override of a port this manager no longer uses.
    async fn restore_default_vlan(&self, port: &PortRef) -> VcmResult<()> {
        match self.clients.hypervisor.set_vlan(port, None).await {
            Err(e) if e.is_stale() || e.is_not_found() => {
                debug!(%port, "port gone, nothing to restore");
                Ok(())
            }
            other => other,
        }
    }

    /// Reserves every VLAN id configured on this host's switch ports,
    /// including both ids of private VLAN pairs.
    #[instrument(skip(self, state))]
    pub async fn sync_vlan_ids(&self, state: &mut SyncState) -> VcmResult<()> {
        let reservations = self.clients.hypervisor.get_reserved_vlans_on_host().await?;
        for reservation in &reservations {
            for id in reservation.ids() {
                state.vlan_pool.reserve(id);
            }
        }
        info!(
            reserved = state.vlan_pool.reserved_count(),
            "Synchronized VLAN reservations"
        );
        Ok(())
    }

    /// Handles an address reported by the guest.
    ///
    /// Only interfaces on externally managed networks take their address
    /// from the guest, and only an actual change is propagated.
    #[instrument(skip(self, state))]
    pub async fn update_guest_ip(
        &self,
        state: &mut SyncState,
        mac: &MacAddress,
        ip: IpAddr,
    ) -> VcmResult<bool> {
        let Some(mut vmi) = state.db.get_vmi_by_mac(mac).cloned() else {
            return Ok(false);
        };
        let Some(vn) = state.db.get_vn(&vmi.vn_uuid).cloned() else {
            return Ok(false);
        };
        if !vn.external_ipam || vmi.ip_address == Some(ip) {
            return Ok(false);
        }

        vmi.ip_address = Some(ip);
        self.sync_instance_ip(&vn, &mut vmi).await?;
        info!(vmi = %vmi.uuid, %ip, "Guest address changed");

        state.db.dataplane_ports_pending_upsert.enqueue(vmi.uuid, ());
        state.db.save(vmi);
        Ok(true)
    }

    /// Deletes controller interfaces of this project that nothing tracks.
    ///
    /// An interface whose VM the inventory places on another host belongs
    /// to that host's manager and is left alone.
    #[instrument(skip(self, state))]
    pub async fn sweep(&self, state: &mut SyncState) -> VcmResult<()> {
        let project = state.project()?;
        let controller = self.clients.controller.as_ref();

        for vmi in controller.list_interfaces(&project.project).await? {
            if state.db.get_vmi(&vmi.uuid).is_some() {
                continue;
            }
            if state.db.get_vm(&vmi.vm_uuid).is_none() {
                if let Some(host) = self.clients.hypervisor.locate_vm(&vmi.vm_uuid).await? {
                    if host != self.settings.local_host {
                        debug!(vmi = %vmi.uuid, %host, "interface owned by another host");
                        continue;
                    }
                }
            }

            info!(vmi = %vmi.uuid, name = %vmi.display_name, "Deleting stale interface");
            let iip = ids::instance_ip_uuid(&vmi.uuid);
            ignore_not_found(controller.delete_instance_ip(&iip).await, "instance-ip", &iip)?;
            ignore_not_found(
                controller.delete_interface(&vmi.uuid).await,
                "virtual-machine-interface",
                &vmi.uuid,
            )?;
            state.db.dataplane_ports_pending_delete.enqueue(vmi.uuid, ());
        }
        Ok(())
    }
}

async fn create_instance_ip(
    controller: &dyn ControllerApi,
    iip: &ControllerInstanceIp,
) -> VcmResult<ControllerInstanceIp> {
    match controller.create_instance_ip(iip).await {
        Err(e) if e.is_already_exists() => controller
            .read_instance_ip(&iip.uuid)
            .await?
            .ok_or_else(|| VcmError::not_found("instance-ip", iip.uuid)),
        other => other,
    }
}
