//! In-memory SDN controller.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;
use vcm_common::{
    ControllerApi, ControllerInstanceIp, ControllerInterface, ControllerNetwork, ControllerVm,
    VcmError, VcmResult,
};

/// A mutating call received by [`FakeController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerOp {
    CreateVm,
    UpdateVm,
    DeleteVm,
    CreateInterface,
    UpdateInterface,
    DeleteInterface,
    CreateInstanceIp,
    UpdateInstanceIp,
    DeleteInstanceIp,
}

#[derive(Default)]
struct Objects {
    projects: HashMap<(String, String), Uuid>,
    security_groups: HashMap<(Uuid, String), Uuid>,
    ipams: HashMap<(Uuid, String), Uuid>,
    vms: BTreeMap<Uuid, ControllerVm>,
    networks: BTreeMap<Uuid, ControllerNetwork>,
    interfaces: BTreeMap<Uuid, ControllerInterface>,
    instance_ips: BTreeMap<Uuid, ControllerInstanceIp>,
    next_address: u32,
    next_id: u128,
    unreachable: bool,
}

impl Objects {
    fn new_id(&mut self) -> Uuid {
        self.next_id += 1;
        Uuid::from_u128(0xc0_0000 + self.next_id)
    }
}

/// Controller with create/update/delete semantics of the real API:
/// updating or deleting a missing object fails with `NotFound`, creating
/// an existing one with `AlreadyExists`.
///
/// Instance IPs created without an address get the next address of
/// 10.0.0.0/24.
#[derive(Default)]
pub struct FakeController {
    objects: Mutex<Objects>,
    calls: Mutex<Vec<(ControllerOp, Uuid)>>,
}

impl FakeController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a network to the project `ensure_project` hands out for
    /// `domain`/`project`.
    pub fn add_network(&self, domain: &str, project: &str, name: &str, external_ipam: bool) -> Uuid {
        let mut objects = self.objects.lock();
        let project = project_id(&mut objects, domain, project);
        let uuid = objects.new_id();
        objects.networks.insert(
            uuid,
            ControllerNetwork {
                uuid,
                name: name.to_string(),
                project,
                external_ipam,
            },
        );
        uuid
    }

    pub fn remove_network(&self, uuid: &Uuid) {
        self.objects.lock().networks.remove(uuid);
    }

    /// Stores objects without recording calls, as if left by an earlier run.
    pub fn seed_vm(&self, vm: ControllerVm) {
        self.objects.lock().vms.insert(vm.uuid, vm);
    }

    pub fn seed_interface(&self, vmi: ControllerInterface) {
        self.objects.lock().interfaces.insert(vmi.uuid, vmi);
    }

    /// Makes every call fail with a lost connection.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.objects.lock().unreachable = unreachable;
    }

    pub fn vm(&self, uuid: &Uuid) -> Option<ControllerVm> {
        self.objects.lock().vms.get(uuid).cloned()
    }

    pub fn vms(&self) -> Vec<ControllerVm> {
        self.objects.lock().vms.values().cloned().collect()
    }

    pub fn interface(&self, uuid: &Uuid) -> Option<ControllerInterface> {
        self.objects.lock().interfaces.get(uuid).cloned()
    }

    pub fn interfaces(&self) -> Vec<ControllerInterface> {
        self.objects.lock().interfaces.values().cloned().collect()
    }

    pub fn instance_ip(&self, uuid: &Uuid) -> Option<ControllerInstanceIp> {
        self.objects.lock().instance_ips.get(uuid).cloned()
    }

    pub fn instance_ips(&self) -> Vec<ControllerInstanceIp> {
        self.objects.lock().instance_ips.values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<(ControllerOp, Uuid)> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of calls of one kind.
    pub fn count(&self, op: ControllerOp) -> usize {
        self.calls.lock().iter().filter(|(o, _)| *o == op).count()
    }

    fn record(&self, op: ControllerOp, uuid: Uuid) -> VcmResult<()> {
        self.calls.lock().push((op, uuid));
        self.check_reachable()
    }

    fn check_reachable(&self) -> VcmResult<()> {
        if self.objects.lock().unreachable {
            return Err(VcmError::connection_lost("controller", "connection refused"));
        }
        Ok(())
    }
}

fn project_id(objects: &mut Objects, domain: &str, name: &str) -> Uuid {
    let key = (domain.to_string(), name.to_string());
    if let Some(uuid) = objects.projects.get(&key) {
        return *uuid;
    }
    let uuid = objects.new_id();
    objects.projects.insert(key, uuid);
    uuid
}

fn insert_new<T: Clone>(
    table: &mut BTreeMap<Uuid, T>,
    kind: &str,
    uuid: Uuid,
    value: &T,
) -> VcmResult<()> {
    if table.contains_key(&uuid) {
        return Err(VcmError::already_exists(kind, uuid));
    }
    table.insert(uuid, value.clone());
    Ok(())
}

fn replace<T: Clone>(
    table: &mut BTreeMap<Uuid, T>,
    kind: &str,
    uuid: Uuid,
    value: &T,
) -> VcmResult<()> {
    match table.get_mut(&uuid) {
        Some(existing) => {
            *existing = value.clone();
            Ok(())
        }
        None => Err(VcmError::not_found(kind, uuid)),
    }
}

fn remove<T>(table: &mut BTreeMap<Uuid, T>, kind: &str, uuid: &Uuid) -> VcmResult<()> {
    table
        .remove(uuid)
        .map(|_| ())
        .ok_or_else(|| VcmError::not_found(kind, uuid))
}

#[async_trait]
impl ControllerApi for FakeController {
    async fn ensure_project(&self, domain: &str, name: &str) -> VcmResult<Uuid> {
        self.check_reachable()?;
        Ok(project_id(&mut self.objects.lock(), domain, name))
    }

    async fn ensure_security_group(&self, project: &Uuid, name: &str) -> VcmResult<Uuid> {
        self.check_reachable()?;
        let mut objects = self.objects.lock();
        let key = (*project, name.to_string());
        if let Some(uuid) = objects.security_groups.get(&key) {
            return Ok(*uuid);
        }
        let uuid = objects.new_id();
        objects.security_groups.insert(key, uuid);
        Ok(uuid)
    }

    async fn ensure_ipam(&self, project: &Uuid, name: &str) -> VcmResult<Uuid> {
        self.check_reachable()?;
        let mut objects = self.objects.lock();
        let key = (*project, name.to_string());
        if let Some(uuid) = objects.ipams.get(&key) {
            return Ok(*uuid);
        }
        let uuid = objects.new_id();
        objects.ipams.insert(key, uuid);
        Ok(uuid)
    }

    async fn read_vm(&self, uuid: &Uuid) -> VcmResult<Option<ControllerVm>> {
        self.check_reachable()?;
        Ok(self.vm(uuid))
    }

    async fn create_vm(&self, vm: &ControllerVm) -> VcmResult<()> {
        self.record(ControllerOp::CreateVm, vm.uuid)?;
        insert_new(&mut self.objects.lock().vms, "virtual-machine", vm.uuid, vm)
    }

    async fn update_vm(&self, vm: &ControllerVm) -> VcmResult<()> {
        self.record(ControllerOp::UpdateVm, vm.uuid)?;
        replace(&mut self.objects.lock().vms, "virtual-machine", vm.uuid, vm)
    }

    async fn delete_vm(&self, uuid: &Uuid) -> VcmResult<()> {
        self.record(ControllerOp::DeleteVm, *uuid)?;
        remove(&mut self.objects.lock().vms, "virtual-machine", uuid)
    }

    async fn list_vms(&self, project: &Uuid) -> VcmResult<Vec<ControllerVm>> {
        self.check_reachable()?;
        Ok(self
            .objects
            .lock()
            .vms
            .values()
            .filter(|vm| vm.project == *project)
            .cloned()
            .collect())
    }

    async fn read_network_by_name(
        &self,
        project: &Uuid,
        name: &str,
    ) -> VcmResult<Option<ControllerNetwork>> {
        self.check_reachable()?;
        Ok(self
            .objects
            .lock()
            .networks
            .values()
            .find(|vn| vn.project == *project && vn.name == name)
            .cloned())
    }

    async fn list_networks(&self, project: &Uuid) -> VcmResult<Vec<ControllerNetwork>> {
        self.check_reachable()?;
        Ok(self
            .objects
            .lock()
            .networks
            .values()
            .filter(|vn| vn.project == *project)
            .cloned()
            .collect())
    }

    async fn read_interface(&self, uuid: &Uuid) -> VcmResult<Option<ControllerInterface>> {
        self.check_reachable()?;
        Ok(self.interface(uuid))
    }

    async fn create_interface(&self, vmi: &ControllerInterface) -> VcmResult<()> {
        self.record(ControllerOp::CreateInterface, vmi.uuid)?;
        insert_new(
            &mut self.objects.lock().interfaces,
            "virtual-machine-interface",
            vmi.uuid,
            vmi,
        )
    }

    async fn update_interface(&self, vmi: &ControllerInterface) -> VcmResult<()> {
        self.record(ControllerOp::UpdateInterface, vmi.uuid)?;
        replace(
            &mut self.objects.lock().interfaces,
            "virtual-machine-interface",
            vmi.uuid,
            vmi,
        )
    }

    async fn delete_interface(&self, uuid: &Uuid) -> VcmResult<()> {
        self.record(ControllerOp::DeleteInterface, *uuid)?;
        remove(
            &mut self.objects.lock().interfaces,
            "virtual-machine-interface",
            uuid,
        )
    }

    async fn list_interfaces(&self, project: &Uuid) -> VcmResult<Vec<ControllerInterface>> {
        self.check_reachable()?;
        Ok(self
            .objects
            .lock()
            .interfaces
            .values()
            .filter(|vmi| vmi.project == *project)
            .cloned()
            .collect())
    }

    async fn read_instance_ip(&self, uuid: &Uuid) -> VcmResult<Option<ControllerInstanceIp>> {
        self.check_reachable()?;
        Ok(self.instance_ip(uuid))
    }

    async fn create_instance_ip(
        &self,
        iip: &ControllerInstanceIp,
    ) -> VcmResult<ControllerInstanceIp> {
        self.record(ControllerOp::CreateInstanceIp, iip.uuid)?;
        let mut objects = self.objects.lock();
        let mut created = iip.clone();
        if created.address.is_none() {
            objects.next_address += 1;
            let host = objects.next_address;
            created.address = Some(IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + host)));
        }
        insert_new(&mut objects.instance_ips, "instance-ip", iip.uuid, &created)?;
        Ok(created)
    }

    async fn update_instance_ip(
        &self,
        iip: &ControllerInstanceIp,
    ) -> VcmResult<ControllerInstanceIp> {
        self.record(ControllerOp::UpdateInstanceIp, iip.uuid)?;
        replace(&mut self.objects.lock().instance_ips, "instance-ip", iip.uuid, iip)?;
        Ok(iip.clone())
    }

    async fn delete_instance_ip(&self, uuid: &Uuid) -> VcmResult<()> {
        self.record(ControllerOp::DeleteInstanceIp, *uuid)?;
        remove(&mut self.objects.lock().instance_ips, "instance-ip", uuid)
    }
}
