//! Entity models tracked by the manager.
//!
//! Entities reference each other by UUID only; the store owns every
//! entity and keeps the reverse indices (VM → interfaces, network →
//! interfaces).

use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;
use vcm_common::{
    ControllerInterface, ControllerVm, DataplanePort, PortRef, SubscriptionHandle, VmHandle,
    VmProperties,
};
use vcm_types::{ids, MacAddress, PowerState, VlanId};

use crate::vlan_pool::VlanIdPool;

/// A VM mirrored from the hypervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualMachineModel {
    /// Hypervisor instance UUID; stable across migration and rename.
    pub uuid: Uuid,
    pub name: String,
    pub handle: VmHandle,
    pub host: String,
    pub power_state: PowerState,
    pub tools_running: bool,
    /// NICs attached to distributed port groups, by MAC.
    pub interfaces: BTreeMap<MacAddress, PortRef>,
    /// Property subscription, cancelled on removal.
    pub subscription: Option<SubscriptionHandle>,
}

impl VirtualMachineModel {
    /// Builds a model from a property snapshot of a VM that has a UUID.
    pub fn from_properties(uuid: Uuid, handle: VmHandle, props: &VmProperties) -> Self {
        Self {
            uuid,
            name: props.name.clone(),
            handle,
            host: props.host.clone(),
            power_state: props.power_state,
            tools_running: props.tools_status.is_running(),
            interfaces: interfaces_of(props),
            subscription: None,
        }
    }

    /// The controller's view of this VM.
    pub fn to_controller(&self, project: Uuid) -> ControllerVm {
        ControllerVm {
            uuid: self.uuid,
            name: self.name.clone(),
            project,
        }
    }
}

/// MAC → port map of the NICs backed by a distributed port group.
///
/// A VM gets one interface per network, so only the NIC with the lowest
/// MAC on each port group is kept.
pub fn interfaces_of(props: &VmProperties) -> BTreeMap<MacAddress, PortRef> {
    let mut by_group: BTreeMap<&str, (MacAddress, &PortRef)> = BTreeMap::new();
    for device in &props.devices {
        let Some(port) = &device.port else {
            continue;
        };
        by_group
            .entry(port.port_group_key.as_str())
            .and_modify(|chosen| {
                if device.mac < chosen.0 {
                    *chosen = (device.mac, port);
                }
            })
            .or_insert((device.mac, port));
    }
    by_group
        .into_values()
        .map(|(mac, port)| (mac, port.clone()))
        .collect()
}

/// A port group that maps onto a controller network.
#[derive(Debug, Clone)]
pub struct VirtualNetworkModel {
    /// Derived from the port-group key.
    pub uuid: Uuid,
    /// Port-group key.
    pub key: String,
    /// Port-group name, equal to the controller network's name.
    pub name: String,
    /// UUID of the controller's network object.
    pub controller_uuid: Uuid,
    pub external_ipam: bool,
    /// Present only when VLAN ids are scoped per network.
    pub vlan_pool: Option<VlanIdPool>,
}

impl VirtualNetworkModel {
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        controller_uuid: Uuid,
        external_ipam: bool,
    ) -> Self {
        let key = key.into();
        Self {
            uuid: ids::network_uuid(&key),
            key,
            name: name.into(),
            controller_uuid,
            external_ipam,
            vlan_pool: None,
        }
    }
}

/// An interface connecting a VM to a managed network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMachineInterfaceModel {
    /// Derived from the owning VM and network.
    pub uuid: Uuid,
    pub mac: MacAddress,
    pub port: PortRef,
    pub vlan_id: Option<VlanId>,
    pub ip_address: Option<IpAddr>,
    pub instance_ip_uuid: Option<Uuid>,
    pub vm_uuid: Uuid,
    pub vn_uuid: Uuid,
    /// Controller UUID of the network, as the agent and controller know it.
    pub vn_controller_uuid: Uuid,
    pub vm_name: String,
    pub vn_name: String,
    pub display_name: String,
}

impl VirtualMachineInterfaceModel {
    pub fn new(
        vm: &VirtualMachineModel,
        vn: &VirtualNetworkModel,
        mac: MacAddress,
        port: PortRef,
    ) -> Self {
        Self {
            uuid: ids::interface_uuid(&vm.uuid, &vn.uuid),
            mac,
            port,
            vlan_id: None,
            ip_address: None,
            instance_ip_uuid: None,
            vm_uuid: vm.uuid,
            vn_uuid: vn.uuid,
            vn_controller_uuid: vn.controller_uuid,
            vm_name: vm.name.clone(),
            vn_name: vn.name.clone(),
            display_name: display_name(&vn.name, &vm.name),
        }
    }

    /// Updates the owner's name and the derived display name.
    pub fn rename_vm(&mut self, vm_name: &str) {
        self.vm_name = vm_name.to_string();
        self.display_name = display_name(&self.vn_name, vm_name);
    }

    pub fn to_controller(&self, project: Uuid, security_group: Option<Uuid>) -> ControllerInterface {
        ControllerInterface {
            uuid: self.uuid,
            display_name: self.display_name.clone(),
            project,
            vm_uuid: self.vm_uuid,
            vn_uuid: self.vn_controller_uuid,
            mac: self.mac,
            security_group,
        }
    }

    pub fn to_dataplane(&self) -> DataplanePort {
        DataplanePort {
            uuid: self.uuid,
            vm_uuid: self.vm_uuid,
            vn_uuid: self.vn_controller_uuid,
            display_name: self.display_name.clone(),
            mac: self.mac,
            ip: self.ip_address,
            vlan: self.vlan_id,
            port_key: self.port.port_key.clone(),
        }
    }
}

/// `vmi-<network name>-<vm name>`
pub fn display_name(vn_name: &str, vm_name: &str) -> String {
    format!("vmi-{}-{}", vn_name, vm_name)
}

/// How far a deletion reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalMode {
    /// The object is gone from the cluster: delete it everywhere.
    Full,
    /// The object lives on elsewhere (e.g. after a migration): forget it
    /// locally, leave the controller and the hypervisor untouched.
    LocalOnly,
}

/// A NIC waiting for its interface to be created or refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInterface {
    pub vm_uuid: Uuid,
    pub mac: MacAddress,
    pub port: PortRef,
}

impl PendingInterface {
    /// Queue key: the UUID the interface has or will have.
    pub fn key(&self) -> Uuid {
        ids::interface_uuid(&self.vm_uuid, &ids::network_uuid(&self.port.port_group_key))
    }
}

/// An interface waiting to be deleted, captured before it left the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelete {
    pub vmi: VirtualMachineInterfaceModel,
    pub mode: RemovalMode,
}

/// Outcome of removing a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedVm {
    pub uuid: Uuid,
    pub mode: RemovalMode,
}
