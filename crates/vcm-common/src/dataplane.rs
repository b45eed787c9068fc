//! Dataplane agent port API contract.

use crate::VcmResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;
use vcm_types::{MacAddress, VlanId};

/// A port as the dataplane agent knows it.
///
/// The agent has no partial update: a port whose content changed is
/// deleted and added again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataplanePort {
    /// Interface UUID.
    pub uuid: Uuid,
    pub vm_uuid: Uuid,
    pub vn_uuid: Uuid,
    pub display_name: String,
    pub mac: MacAddress,
    pub ip: Option<IpAddr>,
    pub vlan: Option<VlanId>,
    /// Hypervisor port key the tag is configured on.
    pub port_key: String,
}

impl DataplanePort {
    /// Returns true if the fields the agent forwards on match.
    pub fn same_binding(&self, other: &DataplanePort) -> bool {
        self.vm_uuid == other.vm_uuid
            && self.vn_uuid == other.vn_uuid
            && self.vlan == other.vlan
            && self.ip == other.ip
            && self.mac == other.mac
            && self.port_key == other.port_key
    }
}

/// Dataplane agent port API.
#[async_trait]
pub trait DataplaneApi: Send + Sync {
    async fn add_port(&self, port: &DataplanePort) -> VcmResult<()>;
    async fn delete_port(&self, uuid: &Uuid) -> VcmResult<()>;
    async fn enable_port(&self, uuid: &Uuid) -> VcmResult<()>;
    async fn disable_port(&self, uuid: &Uuid) -> VcmResult<()>;
    async fn read_port(&self, uuid: &Uuid) -> VcmResult<Option<DataplanePort>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port() -> DataplanePort {
        DataplanePort {
            uuid: Uuid::from_u128(1),
            vm_uuid: Uuid::from_u128(2),
            vn_uuid: Uuid::from_u128(3),
            display_name: "vmi-DPG1-vm-1".to_string(),
            mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            ip: None,
            vlan: VlanId::new(2).ok(),
            port_key: "10".to_string(),
        }
    }

    #[test]
    fn test_same_binding_ignores_display_name() {
        let mut renamed = port();
        renamed.display_name = "vmi-DPG1-vm-2".to_string();
        assert!(port().same_binding(&renamed));
    }

    #[test]
    fn test_binding_differs_on_vlan_or_ip() {
        let mut retagged = port();
        retagged.vlan = VlanId::new(3).ok();
        assert!(!port().same_binding(&retagged));

        let mut addressed = port();
        addressed.ip = Some("10.0.0.5".parse().unwrap());
        assert!(!port().same_binding(&addressed));
    }

    #[test]
    fn test_binding_differs_on_nic() {
        let mut moved = port();
        moved.mac = "aa:bb:cc:dd:ee:01".parse().unwrap();
        moved.port_key = "11".to_string();
        assert!(!port().same_binding(&moved));
    }
}
