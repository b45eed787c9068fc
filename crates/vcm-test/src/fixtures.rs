//! Test fixtures: VM builders, change batch builders and common names.

use std::net::IpAddr;
use uuid::Uuid;
use vcm_common::{
    ChangeBatch, EventKind, GuestNic, HypervisorEvent, NetworkDevice, ObjectUpdate, PortRef,
    PropertyChange, PropertyValue, VmHandle, VmProperties, PROP_GUEST_NET, PROP_LATEST_PAGE,
    PROP_POWER_STATE, PROP_TOOLS_STATUS,
};
use vcm_types::{MacAddress, PowerState, ToolsStatus, VlanId};

/// Host the manager under test runs for.
pub const LOCAL_HOST: &str = "esxi-1";
/// Some other host in the cluster.
pub const REMOTE_HOST: &str = "esxi-2";
pub const DOMAIN: &str = "default-domain";
pub const PROJECT: &str = "vCenter";

/// Handle of the event history collector.
pub fn event_collector() -> VmHandle {
    VmHandle::new("session[events]")
}

/// Parses a MAC address literal.
///
/// # Panics
/// On a malformed literal.
pub fn mac(s: &str) -> MacAddress {
    s.parse().expect("valid MAC literal")
}

/// # Panics
/// When `id` is out of range.
pub fn vlan(id: u16) -> VlanId {
    VlanId::new(id).expect("valid VLAN id")
}

/// Builds the property snapshot of a VM.
#[derive(Debug, Clone)]
pub struct VmBuilder {
    props: VmProperties,
}

impl VmBuilder {
    /// A powered-on VM on [`LOCAL_HOST`] with running guest tools.
    pub fn new(name: &str, uuid: Uuid) -> Self {
        Self {
            props: VmProperties {
                uuid: Some(uuid),
                name: name.to_string(),
                power_state: PowerState::PoweredOn,
                tools_status: ToolsStatus::Running,
                is_template: false,
                host: LOCAL_HOST.to_string(),
                devices: Vec::new(),
                guest_nics: Vec::new(),
            },
        }
    }

    pub fn host(mut self, host: &str) -> Self {
        self.props.host = host.to_string();
        self
    }

    pub fn power(mut self, state: PowerState) -> Self {
        self.props.power_state = state;
        self
    }

    pub fn template(mut self) -> Self {
        self.props.is_template = true;
        self
    }

    /// A VM still being created has no UUID yet.
    pub fn without_uuid(mut self) -> Self {
        self.props.uuid = None;
        self
    }

    /// Adds a NIC on a distributed port.
    pub fn nic(mut self, mac_addr: &str, port_group_key: &str, port_key: &str) -> Self {
        self.props.devices.push(NetworkDevice {
            mac: mac(mac_addr),
            port: Some(PortRef::new(port_group_key, port_key)),
        });
        self
    }

    /// Adds a NIC on a standard switch.
    pub fn standard_nic(mut self, mac_addr: &str) -> Self {
        self.props.devices.push(NetworkDevice {
            mac: mac(mac_addr),
            port: None,
        });
        self
    }

    pub fn guest_ip(mut self, mac_addr: &str, ip: &str) -> Self {
        self.props.guest_nics.push(guest_nic(mac_addr, ip));
        self
    }

    pub fn build(self) -> VmProperties {
        self.props
    }
}

/// # Panics
/// On a malformed address literal.
pub fn guest_nic(mac_addr: &str, ip: &str) -> GuestNic {
    GuestNic {
        mac: mac(mac_addr),
        ip_addresses: vec![ip.parse::<IpAddr>().expect("valid IP literal")],
    }
}

/// A batch with one change of one object.
pub fn single_change(object: VmHandle, name: &str, value: PropertyValue) -> ChangeBatch {
    ChangeBatch {
        updates: vec![ObjectUpdate {
            object,
            changes: vec![PropertyChange::new(name, value)],
        }],
    }
}

/// A page of lifecycle events from the event collector.
pub fn events_batch(events: Vec<HypervisorEvent>) -> ChangeBatch {
    single_change(event_collector(), PROP_LATEST_PAGE, PropertyValue::Events(events))
}

pub fn event(kind: EventKind, vm: &VmHandle, name: &str) -> HypervisorEvent {
    HypervisorEvent::new(kind, Some(vm.clone()), name)
}

pub fn power_batch(vm: &VmHandle, state: PowerState) -> ChangeBatch {
    single_change(vm.clone(), PROP_POWER_STATE, PropertyValue::PowerState(state))
}

pub fn tools_batch(vm: &VmHandle, status: ToolsStatus) -> ChangeBatch {
    single_change(vm.clone(), PROP_TOOLS_STATUS, PropertyValue::ToolsStatus(status))
}

pub fn guest_net_batch(vm: &VmHandle, nics: Vec<GuestNic>) -> ChangeBatch {
    single_change(vm.clone(), PROP_GUEST_NET, PropertyValue::GuestNics(nics))
}
