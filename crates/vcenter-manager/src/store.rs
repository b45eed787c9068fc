//! In-memory entity store and pending-work queues.

use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;
use vcm_common::{PendingQueue, VmHandle};
use vcm_types::MacAddress;

use crate::models::{
    PendingDelete, PendingInterface, VirtualMachineInterfaceModel, VirtualMachineModel,
    VirtualNetworkModel,
};
use crate::vlan_pool::VlanIdPool;

/// Any entity the store holds.
#[derive(Debug, Clone)]
pub enum Entity {
    Vm(VirtualMachineModel),
    Vn(VirtualNetworkModel),
    Vmi(VirtualMachineInterfaceModel),
}

impl From<VirtualMachineModel> for Entity {
    fn from(vm: VirtualMachineModel) -> Self {
        Entity::Vm(vm)
    }
}

impl From<VirtualNetworkModel> for Entity {
    fn from(vn: VirtualNetworkModel) -> Self {
        Entity::Vn(vn)
    }
}

impl From<VirtualMachineInterfaceModel> for Entity {
    fn from(vmi: VirtualMachineInterfaceModel) -> Self {
        Entity::Vmi(vmi)
    }
}

/// Entity tables, their secondary indices, and the four work queues.
///
/// Secondary indices are maintained on every save and delete; a re-saved
/// entity whose indexed fields changed is re-indexed.
#[derive(Debug, Default)]
pub struct Database {
    vms: HashMap<Uuid, VirtualMachineModel>,
    vm_by_name: HashMap<String, Uuid>,
    vm_by_handle: HashMap<VmHandle, Uuid>,

    vns: HashMap<Uuid, VirtualNetworkModel>,
    vn_by_key: HashMap<String, Uuid>,
    vn_by_name: HashMap<String, Uuid>,

    vmis: HashMap<Uuid, VirtualMachineInterfaceModel>,
    vmi_by_mac: HashMap<MacAddress, Uuid>,
    vmis_by_owner: HashMap<Uuid, BTreeSet<Uuid>>,
    vmis_by_network: HashMap<Uuid, BTreeSet<Uuid>>,

    /// NICs whose interface must be created or refreshed, keyed by VMI UUID.
    pub interfaces_pending_reconfigure: PendingQueue<Uuid, PendingInterface>,
    /// Interfaces to delete, keyed by VMI UUID.
    pub interfaces_pending_delete: PendingQueue<Uuid, PendingDelete>,
    /// Dataplane ports to add or refresh, keyed by VMI UUID.
    pub dataplane_ports_pending_upsert: PendingQueue<Uuid, ()>,
    /// Dataplane ports to delete, keyed by VMI UUID.
    pub dataplane_ports_pending_delete: PendingQueue<Uuid, ()>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity by identity.
    pub fn save(&mut self, entity: impl Into<Entity>) {
        match entity.into() {
            Entity::Vm(vm) => self.save_vm(vm),
            Entity::Vn(vn) => self.save_vn(vn),
            Entity::Vmi(vmi) => self.save_vmi(vmi),
        }
    }

    fn save_vm(&mut self, vm: VirtualMachineModel) {
        if let Some(old) = self.vms.get(&vm.uuid) {
            let (old_name, old_handle) = (old.name.clone(), old.handle.clone());
            remove_if_points_to(&mut self.vm_by_name, &old_name, &vm.uuid);
            remove_if_points_to(&mut self.vm_by_handle, &old_handle, &vm.uuid);
        }
        self.vm_by_name.insert(vm.name.clone(), vm.uuid);
        self.vm_by_handle.insert(vm.handle.clone(), vm.uuid);
        self.vms.insert(vm.uuid, vm);
    }

    fn save_vn(&mut self, vn: VirtualNetworkModel) {
        if let Some(old) = self.vns.get(&vn.uuid) {
            let (old_key, old_name) = (old.key.clone(), old.name.clone());
            remove_if_points_to(&mut self.vn_by_key, &old_key, &vn.uuid);
            remove_if_points_to(&mut self.vn_by_name, &old_name, &vn.uuid);
        }
        self.vn_by_key.insert(vn.key.clone(), vn.uuid);
        self.vn_by_name.insert(vn.name.clone(), vn.uuid);
        self.vns.insert(vn.uuid, vn);
    }

    fn save_vmi(&mut self, vmi: VirtualMachineInterfaceModel) {
        self.unindex_vmi(&vmi.uuid);
        self.vmi_by_mac.insert(vmi.mac, vmi.uuid);
        self.vmis_by_owner
            .entry(vmi.vm_uuid)
            .or_default()
            .insert(vmi.uuid);
        self.vmis_by_network
            .entry(vmi.vn_uuid)
            .or_default()
            .insert(vmi.uuid);
        self.vmis.insert(vmi.uuid, vmi);
    }

    fn unindex_vmi(&mut self, uuid: &Uuid) {
        let Some(old) = self.vmis.get(uuid) else {
            return;
        };
        let (mac, owner, network) = (old.mac, old.vm_uuid, old.vn_uuid);
        remove_if_points_to(&mut self.vmi_by_mac, &mac, uuid);
        remove_from_set(&mut self.vmis_by_owner, &owner, uuid);
        remove_from_set(&mut self.vmis_by_network, &network, uuid);
    }

    pub fn get_vm(&self, uuid: &Uuid) -> Option<&VirtualMachineModel> {
        self.vms.get(uuid)
    }

    pub fn get_vm_by_name(&self, name: &str) -> Option<&VirtualMachineModel> {
        self.vm_by_name.get(name).and_then(|uuid| self.vms.get(uuid))
    }

    pub fn get_vm_by_handle(&self, handle: &VmHandle) -> Option<&VirtualMachineModel> {
        self.vm_by_handle
            .get(handle)
            .and_then(|uuid| self.vms.get(uuid))
    }

    pub fn get_vn(&self, uuid: &Uuid) -> Option<&VirtualNetworkModel> {
        self.vns.get(uuid)
    }

    pub fn get_vn_by_key(&self, key: &str) -> Option<&VirtualNetworkModel> {
        self.vn_by_key.get(key).and_then(|uuid| self.vns.get(uuid))
    }

    pub fn get_vn_by_name(&self, name: &str) -> Option<&VirtualNetworkModel> {
        self.vn_by_name.get(name).and_then(|uuid| self.vns.get(uuid))
    }

    /// Per-network VLAN pool of a network, if it has one.
    pub fn vn_vlan_pool_mut(&mut self, uuid: &Uuid) -> Option<&mut VlanIdPool> {
        self.vns.get_mut(uuid).and_then(|vn| vn.vlan_pool.as_mut())
    }

    pub fn get_vmi(&self, uuid: &Uuid) -> Option<&VirtualMachineInterfaceModel> {
        self.vmis.get(uuid)
    }

    pub fn get_vmi_by_mac(&self, mac: &MacAddress) -> Option<&VirtualMachineInterfaceModel> {
        self.vmi_by_mac.get(mac).and_then(|uuid| self.vmis.get(uuid))
    }

    /// Interfaces owned by a VM, in UUID order.
    pub fn list_by_owner(&self, vm_uuid: &Uuid) -> Vec<&VirtualMachineInterfaceModel> {
        self.collect_vmis(self.vmis_by_owner.get(vm_uuid))
    }

    /// Interfaces attached to a network, in UUID order.
    pub fn list_by_network(&self, vn_uuid: &Uuid) -> Vec<&VirtualMachineInterfaceModel> {
        self.collect_vmis(self.vmis_by_network.get(vn_uuid))
    }

    fn collect_vmis(&self, ids: Option<&BTreeSet<Uuid>>) -> Vec<&VirtualMachineInterfaceModel> {
        ids.into_iter()
            .flatten()
            .filter_map(|uuid| self.vmis.get(uuid))
            .collect()
    }

    pub fn vms(&self) -> impl Iterator<Item = &VirtualMachineModel> {
        self.vms.values()
    }

    pub fn vns(&self) -> impl Iterator<Item = &VirtualNetworkModel> {
        self.vns.values()
    }

    pub fn vmis(&self) -> impl Iterator<Item = &VirtualMachineInterfaceModel> {
        self.vmis.values()
    }

    pub fn delete_vm(&mut self, uuid: &Uuid) -> Option<VirtualMachineModel> {
        let vm = self.vms.remove(uuid)?;
        remove_if_points_to(&mut self.vm_by_name, &vm.name, uuid);
        remove_if_points_to(&mut self.vm_by_handle, &vm.handle, uuid);
        Some(vm)
    }

    pub fn delete_vn(&mut self, uuid: &Uuid) -> Option<VirtualNetworkModel> {
        let vn = self.vns.remove(uuid)?;
        remove_if_points_to(&mut self.vn_by_key, &vn.key, uuid);
        remove_if_points_to(&mut self.vn_by_name, &vn.name, uuid);
        Some(vn)
    }

    pub fn delete_vmi(&mut self, uuid: &Uuid) -> Option<VirtualMachineInterfaceModel> {
        self.unindex_vmi(uuid);
        self.vmis.remove(uuid)
    }

    /// Drops every entity and pending entry.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

fn remove_if_points_to<K>(index: &mut HashMap<K, Uuid>, key: &K, uuid: &Uuid)
where
    K: Eq + std::hash::Hash,
{
    if index.get(key) == Some(uuid) {
        index.remove(key);
    }
}

fn remove_from_set(index: &mut HashMap<Uuid, BTreeSet<Uuid>>, key: &Uuid, uuid: &Uuid) {
    if let Some(set) = index.get_mut(key) {
        set.remove(uuid);
        if set.is_empty() {
            index.remove(key);
        }
    }
}
