//! In-memory hypervisor.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::mpsc;
use uuid::Uuid;
use vcm_common::{
    ChangeBatch, HypervisorApi, PortGroup, PortRef, SubscriptionHandle, VcmError, VcmResult,
    VlanReservation, VmHandle, VmLocation, VmProperties,
};
use vcm_types::VlanId;

/// A mutating or session call received by [`FakeHypervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorCall {
    Subscribe(VmHandle),
    Unsubscribe(SubscriptionHandle),
    EnableVlanOverride(String),
    SetVlan(PortRef, Option<VlanId>),
    Probe,
    Reconnect,
}

/// How [`FakeHypervisor::probe`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeMode {
    #[default]
    Ok,
    /// Fails with a lost connection.
    Fail,
    /// Never answers.
    Hang,
}

#[derive(Default)]
struct Inventory {
    vms: BTreeMap<VmHandle, VmProperties>,
    stale_vms: HashSet<VmHandle>,
    port_groups: BTreeMap<String, PortGroup>,
    vlans: HashMap<PortRef, VlanId>,
    host_reservations: Vec<VlanReservation>,
    port_group_reservations: HashMap<String, Vec<VlanReservation>>,
    next_subscription: u64,
    subscriptions: HashSet<SubscriptionHandle>,
    probe: ProbeMode,
    failed_reconnects: u32,
}

/// Hypervisor whose inventory tests edit directly.
///
/// Change batches are pushed by the test and handed out in order by
/// `wait_for_change_batch`.
pub struct FakeHypervisor {
    inventory: Mutex<Inventory>,
    calls: Mutex<Vec<HypervisorCall>>,
    sender: mpsc::UnboundedSender<VcmResult<ChangeBatch>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<VcmResult<ChangeBatch>>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inventory: Mutex::new(Inventory::default()),
            calls: Mutex::new(Vec::new()),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    pub fn add_vm(&self, handle: &VmHandle, props: VmProperties) {
        self.inventory.lock().vms.insert(handle.clone(), props);
    }

    pub fn remove_vm(&self, handle: &VmHandle) -> Option<VmProperties> {
        self.inventory.lock().vms.remove(handle)
    }

    /// Edits a VM's properties in place.
    pub fn update_vm(&self, handle: &VmHandle, f: impl FnOnce(&mut VmProperties)) {
        if let Some(props) = self.inventory.lock().vms.get_mut(handle) {
            f(props);
        }
    }

    /// Adds a VM running on another host.
    pub fn add_remote_vm(&self, uuid: Uuid, name: impl Into<String>, host: impl Into<String>) {
        let name = name.into();
        self.inventory.lock().vms.insert(
            VmHandle::new(format!("remote-{}", name)),
            VmProperties {
                uuid: Some(uuid),
                name,
                host: host.into(),
                ..Default::default()
            },
        );
    }

    /// Makes `read_properties` of a VM fail as if it vanished mid-read.
    pub fn mark_stale(&self, handle: &VmHandle) {
        self.inventory.lock().stale_vms.insert(handle.clone());
    }

    pub fn add_port_group(&self, key: &str, name: &str) {
        self.inventory.lock().port_groups.insert(
            key.to_string(),
            PortGroup {
                key: key.to_string(),
                name: name.to_string(),
            },
        );
    }

    pub fn remove_port_group(&self, key: &str) {
        self.inventory.lock().port_groups.remove(key);
    }

    /// Configures a VLAN override without recording a call.
    pub fn preset_vlan(&self, port: &PortRef, vlan: VlanId) {
        self.inventory.lock().vlans.insert(port.clone(), vlan);
    }

    pub fn vlan_of(&self, port: &PortRef) -> Option<VlanId> {
        self.inventory.lock().vlans.get(port).copied()
    }

    pub fn reserve_on_host(&self, reservation: VlanReservation) {
        self.inventory.lock().host_reservations.push(reservation);
    }

    pub fn reserve_on_port_group(&self, key: &str, reservation: VlanReservation) {
        self.inventory
            .lock()
            .port_group_reservations
            .entry(key.to_string())
            .or_default()
            .push(reservation);
    }

    pub fn set_probe_mode(&self, mode: ProbeMode) {
        self.inventory.lock().probe = mode;
    }

    /// Makes the next `count` reconnect attempts fail.
    pub fn fail_reconnects(&self, count: u32) {
        self.inventory.lock().failed_reconnects = count;
    }

    pub fn push_batch(&self, batch: ChangeBatch) {
        // The receiver lives as long as `self`.
        let _ = self.sender.send(Ok(batch));
    }

    /// Makes the pending wait fail with a lost connection.
    pub fn push_connection_loss(&self) {
        let _ = self
            .sender
            .send(Err(VcmError::connection_lost("hypervisor", "session expired")));
    }

    pub fn calls(&self) -> Vec<HypervisorCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Every `set_vlan` call, in order.
    pub fn set_vlan_calls(&self) -> Vec<(PortRef, Option<VlanId>)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                HypervisorCall::SetVlan(port, vlan) => Some((port.clone(), *vlan)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&HypervisorCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| pred(call)).count()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inventory.lock().subscriptions.len()
    }

    fn record(&self, call: HypervisorCall) {
        self.calls.lock().push(call);
    }
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorApi for FakeHypervisor {
    async fn get_all_vms(&self) -> VcmResult<Vec<VmHandle>> {
        Ok(self.inventory.lock().vms.keys().cloned().collect())
    }

    async fn read_properties(&self, vm: &VmHandle) -> VcmResult<VmProperties> {
        let inventory = self.inventory.lock();
        if inventory.stale_vms.contains(vm) {
            return Err(VcmError::stale(vm.as_str(), "managed object has been deleted"));
        }
        inventory
            .vms
            .get(vm)
            .cloned()
            .ok_or_else(|| VcmError::stale(vm.as_str(), "managed object not found"))
    }

    async fn subscribe(&self, vm: &VmHandle, _filters: &[&str]) -> VcmResult<SubscriptionHandle> {
        self.record(HypervisorCall::Subscribe(vm.clone()));
        let mut inventory = self.inventory.lock();
        inventory.next_subscription += 1;
        let handle = SubscriptionHandle(inventory.next_subscription);
        inventory.subscriptions.insert(handle);
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> VcmResult<()> {
        self.record(HypervisorCall::Unsubscribe(handle));
        if self.inventory.lock().subscriptions.remove(&handle) {
            Ok(())
        } else {
            Err(VcmError::not_found("subscription", handle.0))
        }
    }

    async fn wait_for_change_batch(&self) -> VcmResult<Option<ChangeBatch>> {
        let mut receiver = self.receiver.lock().await;
        match receiver.recv().await {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }

    async fn get_port_group(&self, key: &str) -> VcmResult<Option<PortGroup>> {
        Ok(self.inventory.lock().port_groups.get(key).cloned())
    }

    async fn find_port_group(&self, name: &str) -> VcmResult<Option<PortGroup>> {
        Ok(self
            .inventory
            .lock()
            .port_groups
            .values()
            .find(|pg| pg.name == name)
            .cloned())
    }

    async fn enable_vlan_override(&self, port_group_key: &str) -> VcmResult<()> {
        self.record(HypervisorCall::EnableVlanOverride(port_group_key.to_string()));
        Ok(())
    }

    async fn get_vlan(&self, port: &PortRef) -> VcmResult<Option<VlanId>> {
        Ok(self.vlan_of(port))
    }

    async fn set_vlan(&self, port: &PortRef, vlan: Option<VlanId>) -> VcmResult<()> {
        self.record(HypervisorCall::SetVlan(port.clone(), vlan));
        let mut inventory = self.inventory.lock();
        match vlan {
            Some(id) => inventory.vlans.insert(port.clone(), id),
            None => inventory.vlans.remove(port),
        };
        Ok(())
    }

    async fn get_reserved_vlans_on_host(&self) -> VcmResult<Vec<VlanReservation>> {
        Ok(self.inventory.lock().host_reservations.clone())
    }

    async fn get_reserved_vlans_on_port_group(&self, key: &str) -> VcmResult<Vec<VlanReservation>> {
        Ok(self
            .inventory
            .lock()
            .port_group_reservations
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn locate_vm(&self, uuid: &Uuid) -> VcmResult<Option<String>> {
        Ok(self
            .inventory
            .lock()
            .vms
            .values()
            .find(|props| props.uuid.as_ref() == Some(uuid))
            .map(|props| props.host.clone()))
    }

    async fn locate_vms_by_name(&self, name: &str) -> VcmResult<Vec<VmLocation>> {
        let inventory = self.inventory.lock();
        Ok(inventory
            .vms
            .values()
            .filter(|props| props.name == name)
            .filter_map(|props| {
                props.uuid.map(|uuid| VmLocation {
                    uuid,
                    host: props.host.clone(),
                })
            })
            .collect())
    }

    async fn probe(&self) -> VcmResult<()> {
        self.record(HypervisorCall::Probe);
        let mode = self.inventory.lock().probe;
        match mode {
            ProbeMode::Ok => Ok(()),
            ProbeMode::Fail => Err(VcmError::connection_lost("hypervisor", "probe failed")),
            ProbeMode::Hang => std::future::pending::<VcmResult<()>>().await,
        }
    }

    async fn reconnect(&self) -> VcmResult<()> {
        self.record(HypervisorCall::Reconnect);
        let mut inventory = self.inventory.lock();
        inventory.subscriptions.clear();
        if inventory.failed_reconnects > 0 {
            inventory.failed_reconnects -= 1;
            return Err(VcmError::connection_lost("hypervisor", "login refused"));
        }
        Ok(())
    }
}
