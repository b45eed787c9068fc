//! Hypervisor management API contract.
//!
//! The manager never talks to the hypervisor directly; it consumes this
//! trait. Implementations translate the calls into the hypervisor's own
//! protocol and map its faults onto [`VcmError`](crate::VcmError):
//! a managed object that disappeared becomes `StaleReference`, a dropped
//! session becomes `ConnectionLost`.

use crate::VcmResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;
use vcm_types::{MacAddress, PowerState, ToolsStatus, VlanId};

/// Property carrying the VM lifecycle event stream.
pub const PROP_LATEST_PAGE: &str = "latestPage";
/// Property carrying the guest-reported NICs.
pub const PROP_GUEST_NET: &str = "guest.net";
/// Property carrying the guest tools status.
pub const PROP_TOOLS_STATUS: &str = "guest.toolsRunningStatus";
/// Property carrying the VM power state.
pub const PROP_POWER_STATE: &str = "runtime.powerState";

/// Properties every per-VM subscription watches.
pub const VM_SUBSCRIPTION_FILTERS: &[&str] =
    &[PROP_GUEST_NET, PROP_TOOLS_STATUS, PROP_POWER_STATE];

/// Opaque reference to a VM managed object (e.g. `vm-42`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmHandle(String);

impl VmHandle {
    /// Creates a handle from the managed object id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the managed object id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to a property subscription, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// A distributed switch port, addressed by its port group and port key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    /// Key of the port group the port belongs to (e.g. `dvportgroup-1`).
    pub port_group_key: String,
    /// Key of the port on the distributed switch.
    pub port_key: String,
}

impl PortRef {
    pub fn new(port_group_key: impl Into<String>, port_key: impl Into<String>) -> Self {
        Self {
            port_group_key: port_group_key.into(),
            port_key: port_key.into(),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port_group_key, self.port_key)
    }
}

/// A virtual NIC from the VM's hardware device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDevice {
    pub mac: MacAddress,
    /// Set only when the NIC is backed by a distributed port group.
    pub port: Option<PortRef>,
}

/// A NIC as reported by the guest agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestNic {
    pub mac: MacAddress,
    pub ip_addresses: Vec<IpAddr>,
}

impl GuestNic {
    /// First IPv4 address, falling back to the first address of any family.
    pub fn primary_ip(&self) -> Option<IpAddr> {
        self.ip_addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| self.ip_addresses.first())
            .copied()
    }
}

/// Snapshot of a VM's properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmProperties {
    /// Hypervisor instance UUID; absent while the VM is still being created.
    pub uuid: Option<Uuid>,
    pub name: String,
    pub power_state: PowerState,
    pub tools_status: ToolsStatus,
    pub is_template: bool,
    /// Name of the host the VM runs on.
    pub host: String,
    pub devices: Vec<NetworkDevice>,
    pub guest_nics: Vec<GuestNic>,
}

/// A distributed port group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortGroup {
    pub key: String,
    pub name: String,
}

/// A VLAN id reserved on the distributed switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanReservation {
    Single(VlanId),
    /// A private VLAN holds both its ids.
    PrivatePair { primary: VlanId, secondary: VlanId },
}

impl VlanReservation {
    /// Every id held by this reservation.
    pub fn ids(&self) -> Vec<VlanId> {
        match *self {
            VlanReservation::Single(id) => vec![id],
            VlanReservation::PrivatePair { primary, secondary } => vec![primary, secondary],
        }
    }
}

/// Where the inventory currently places a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLocation {
    pub uuid: Uuid,
    pub host: String,
}

/// Kind of a VM lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Cloned,
    Deployed,
    Registered,
    Reconfigured,
    MacChanged,
    MacAssigned,
    Renamed,
    Removed,
    Migrated,
    Relocated,
    DrsMigrated,
    PoweredOn,
    DrsPoweredOn,
    PoweredOff,
    Suspended,
    /// Any event type the manager does not act on.
    Other(String),
}

impl EventKind {
    /// Events after which the VM's properties must be re-read.
    pub fn requires_observe(&self) -> bool {
        matches!(
            self,
            EventKind::Created
                | EventKind::Cloned
                | EventKind::Deployed
                | EventKind::Registered
                | EventKind::Reconfigured
                | EventKind::MacChanged
                | EventKind::MacAssigned
                | EventKind::Migrated
                | EventKind::Relocated
                | EventKind::DrsMigrated
                | EventKind::PoweredOn
                | EventKind::DrsPoweredOn
        )
    }
}

/// A VM lifecycle event from the event history collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorEvent {
    pub kind: EventKind,
    /// The VM the event refers to, when it still resolves.
    pub vm: Option<VmHandle>,
    pub vm_name: String,
    /// New name, set on rename events.
    pub new_name: Option<String>,
    /// Host the event happened on.
    pub host: Option<String>,
}

impl HypervisorEvent {
    pub fn new(kind: EventKind, vm: Option<VmHandle>, vm_name: impl Into<String>) -> Self {
        Self {
            kind,
            vm,
            vm_name: vm_name.into(),
            new_name: None,
            host: None,
        }
    }

    /// Builds a rename event.
    pub fn renamed(vm: VmHandle, old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Renamed,
            vm: Some(vm),
            vm_name: old_name.into(),
            new_name: Some(new_name.into()),
            host: None,
        }
    }
}

/// New value of a changed property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Events(Vec<HypervisorEvent>),
    GuestNics(Vec<GuestNic>),
    ToolsStatus(ToolsStatus),
    PowerState(PowerState),
    Text(String),
}

/// One changed property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub name: String,
    pub value: PropertyValue,
}

impl PropertyChange {
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// All changes to one object in a batch, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUpdate {
    /// The VM, or the event collector for [`PROP_LATEST_PAGE`] changes.
    pub object: VmHandle,
    pub changes: Vec<PropertyChange>,
}

/// A batch of change notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub updates: Vec<ObjectUpdate>,
}

impl ChangeBatch {
    /// Returns true if the batch carries no change.
    pub fn is_empty(&self) -> bool {
        self.updates.iter().all(|u| u.changes.is_empty())
    }
}

/// Hypervisor management API.
#[async_trait]
pub trait HypervisorApi: Send + Sync {
    /// Every VM in the datacenter.
    async fn get_all_vms(&self) -> VcmResult<Vec<VmHandle>>;

    /// Reads the current properties of a VM.
    async fn read_properties(&self, vm: &VmHandle) -> VcmResult<VmProperties>;

    /// Subscribes to changes of the given properties of a VM.
    async fn subscribe(&self, vm: &VmHandle, filters: &[&str]) -> VcmResult<SubscriptionHandle>;

    /// Cancels a subscription.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> VcmResult<()>;

    /// Blocks until the next batch of changes; `None` when the wait timed
    /// out without changes.
    async fn wait_for_change_batch(&self) -> VcmResult<Option<ChangeBatch>>;

    async fn get_port_group(&self, key: &str) -> VcmResult<Option<PortGroup>>;

    async fn find_port_group(&self, name: &str) -> VcmResult<Option<PortGroup>>;

    /// Allows per-port VLAN overrides on a port group. Idempotent.
    async fn enable_vlan_override(&self, port_group_key: &str) -> VcmResult<()>;

    /// VLAN override currently configured on a port.
    async fn get_vlan(&self, port: &PortRef) -> VcmResult<Option<VlanId>>;

    /// Sets the VLAN override on a port; `None` restores the port group's
    /// default VLAN.
    async fn set_vlan(&self, port: &PortRef, vlan: Option<VlanId>) -> VcmResult<()>;

    /// VLAN ids reserved on switch ports belonging to this host.
    async fn get_reserved_vlans_on_host(&self) -> VcmResult<Vec<VlanReservation>>;

    /// VLAN ids reserved on ports of one port group.
    async fn get_reserved_vlans_on_port_group(&self, key: &str)
        -> VcmResult<Vec<VlanReservation>>;

    /// Host currently running the VM with this UUID, if it still exists.
    async fn locate_vm(&self, uuid: &Uuid) -> VcmResult<Option<String>>;

    /// Locations of every VM with this name. Names are not unique in the
    /// inventory: during a rename two VMs may briefly share one.
    async fn locate_vms_by_name(&self, name: &str) -> VcmResult<Vec<VmLocation>>;

    /// Cheap round trip proving the session is alive.
    async fn probe(&self) -> VcmResult<()>;

    /// Drops and re-establishes the session. Subscriptions are lost.
    async fn reconnect(&self) -> VcmResult<()>;
}
