//! Shared harness: a reconciler wired to the in-memory fakes.

#![allow(dead_code)]

use std::sync::Arc;
use uuid::Uuid;
use vcenter_manager::models::VirtualMachineInterfaceModel;
use vcenter_manager::{Clients, Dispatcher, Reconciler, Settings};
use vcm_common::{ChangeBatch, VcmResult, VmHandle};
use vcm_test::{
    FakeController, FakeDataplane, FakeHypervisor, Verifier, VmBuilder, DOMAIN, LOCAL_HOST,
    PROJECT,
};
use vcm_types::ids;

pub const PG_KEY: &str = "dvportgroup-1";
pub const PG_NAME: &str = "DPG1";
pub const MAC: &str = "aa:bb:cc:dd:ee:ff";

pub fn settings() -> Settings {
    Settings {
        local_host: LOCAL_HOST.to_string(),
        ..Settings::default()
    }
}

pub struct Harness {
    pub hv: Arc<FakeHypervisor>,
    pub controller: Arc<FakeController>,
    pub dataplane: Arc<FakeDataplane>,
    pub reconciler: Reconciler,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(settings())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let hv = Arc::new(FakeHypervisor::new());
        let controller = Arc::new(FakeController::new());
        let dataplane = Arc::new(FakeDataplane::new());
        let clients = Clients::new(hv.clone(), controller.clone(), dataplane.clone());
        Self {
            reconciler: Reconciler::new(clients, Arc::new(settings)),
            dispatcher: Dispatcher::with_default_handlers(),
            hv,
            controller,
            dataplane,
        }
    }

    /// Adds a port group and the controller network of the same name.
    pub fn add_network(&self, key: &str, name: &str, external_ipam: bool) -> Uuid {
        self.hv.add_port_group(key, name);
        self.controller.add_network(DOMAIN, PROJECT, name, external_ipam)
    }

    /// Adds a powered-on local VM with one NIC on `pg_key`, port `port_key`.
    pub fn add_vm(&self, name: &str, uuid: Uuid, mac: &str, pg_key: &str, port_key: &str) -> VmHandle {
        let handle = VmHandle::new(name);
        self.hv
            .add_vm(&handle, VmBuilder::new(name, uuid).nic(mac, pg_key, port_key).build());
        handle
    }

    pub async fn full_sync(&mut self) {
        self.reconciler.full_sync().await.expect("full sync");
    }

    pub async fn dispatch(&mut self, batch: ChangeBatch) -> VcmResult<()> {
        self.dispatcher.dispatch(&mut self.reconciler, &batch).await
    }

    pub fn clear_calls(&self) {
        self.hv.clear_calls();
        self.controller.clear_calls();
        self.dataplane.clear_calls();
    }

    pub fn verifier(&self) -> Verifier<'_> {
        Verifier::new(&self.hv, &self.controller, &self.dataplane)
    }

    /// The interface the store holds for a VM on the network behind `pg_key`.
    pub fn vmi(&self, vm_uuid: Uuid, pg_key: &str) -> Option<VirtualMachineInterfaceModel> {
        let uuid = ids::interface_uuid(&vm_uuid, &ids::network_uuid(pg_key));
        self.reconciler.state.db.get_vmi(&uuid).cloned()
    }
}

pub fn vmi_uuid(vm_uuid: Uuid, pg_key: &str) -> Uuid {
    ids::interface_uuid(&vm_uuid, &ids::network_uuid(pg_key))
}
