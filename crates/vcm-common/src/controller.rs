//! SDN controller API contract.
//!
//! Creates of an object that already exists fail with `AlreadyExists`;
//! updates and deletes of a missing object fail with `NotFound`. Callers
//! decide which of those count as success.

use crate::VcmResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;
use vcm_types::MacAddress;

/// A virtual machine as the controller stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerVm {
    pub uuid: Uuid,
    pub name: String,
    /// Project owning the VM.
    pub project: Uuid,
}

/// A virtual network provisioned in the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerNetwork {
    pub uuid: Uuid,
    pub name: String,
    pub project: Uuid,
    /// Addresses on this network come from an external DHCP server rather
    /// than the controller's IPAM.
    pub external_ipam: bool,
}

/// A virtual machine interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInterface {
    pub uuid: Uuid,
    pub display_name: String,
    pub project: Uuid,
    pub vm_uuid: Uuid,
    pub vn_uuid: Uuid,
    pub mac: MacAddress,
    pub security_group: Option<Uuid>,
}

/// An address lease attached to an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInstanceIp {
    pub uuid: Uuid,
    pub vmi_uuid: Uuid,
    pub vn_uuid: Uuid,
    /// `None` asks the controller to allocate from the network's IPAM.
    pub address: Option<IpAddr>,
}

/// SDN controller API.
#[async_trait]
pub trait ControllerApi: Send + Sync {
    /// Reads or creates the project. Returns its UUID.
    async fn ensure_project(&self, domain: &str, name: &str) -> VcmResult<Uuid>;

    /// Reads or creates a security group in the project.
    async fn ensure_security_group(&self, project: &Uuid, name: &str) -> VcmResult<Uuid>;

    /// Reads or creates a network IPAM in the project.
    async fn ensure_ipam(&self, project: &Uuid, name: &str) -> VcmResult<Uuid>;

    async fn read_vm(&self, uuid: &Uuid) -> VcmResult<Option<ControllerVm>>;
    async fn create_vm(&self, vm: &ControllerVm) -> VcmResult<()>;
    async fn update_vm(&self, vm: &ControllerVm) -> VcmResult<()>;
    async fn delete_vm(&self, uuid: &Uuid) -> VcmResult<()>;
    async fn list_vms(&self, project: &Uuid) -> VcmResult<Vec<ControllerVm>>;

    async fn read_network_by_name(
        &self,
        project: &Uuid,
        name: &str,
    ) -> VcmResult<Option<ControllerNetwork>>;
    async fn list_networks(&self, project: &Uuid) -> VcmResult<Vec<ControllerNetwork>>;

    async fn read_interface(&self, uuid: &Uuid) -> VcmResult<Option<ControllerInterface>>;
    async fn create_interface(&self, vmi: &ControllerInterface) -> VcmResult<()>;
    async fn update_interface(&self, vmi: &ControllerInterface) -> VcmResult<()>;
    async fn delete_interface(&self, uuid: &Uuid) -> VcmResult<()>;
    async fn list_interfaces(&self, project: &Uuid) -> VcmResult<Vec<ControllerInterface>>;

    async fn read_instance_ip(&self, uuid: &Uuid) -> VcmResult<Option<ControllerInstanceIp>>;
    /// Creates the instance IP and returns it with the address the
    /// controller settled on.
    async fn create_instance_ip(&self, iip: &ControllerInstanceIp)
        -> VcmResult<ControllerInstanceIp>;
    async fn update_instance_ip(&self, iip: &ControllerInstanceIp)
        -> VcmResult<ControllerInstanceIp>;
    async fn delete_instance_ip(&self, uuid: &Uuid) -> VcmResult<()>;
}
