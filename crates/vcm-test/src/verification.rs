//! Verification helpers over the fakes' state.

use thiserror::Error;
use uuid::Uuid;
use vcm_common::PortRef;
use vcm_types::VlanId;

use crate::{FakeController, FakeDataplane, FakeHypervisor};

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("{kind} {uuid} not found")]
    Missing { kind: &'static str, uuid: Uuid },

    #[error("{kind} {uuid} still present")]
    Unexpected { kind: &'static str, uuid: Uuid },

    #[error("{what}: expected {expected}, got {actual}")]
    Mismatch {
        what: String,
        expected: String,
        actual: String,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

fn check<T: PartialEq + std::fmt::Debug>(what: String, expected: T, actual: T) -> VerifyResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(VerificationError::Mismatch {
            what,
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        })
    }
}

/// Checks what the manager left in the three systems.
pub struct Verifier<'a> {
    hypervisor: &'a FakeHypervisor,
    controller: &'a FakeController,
    dataplane: &'a FakeDataplane,
}

impl<'a> Verifier<'a> {
    pub fn new(
        hypervisor: &'a FakeHypervisor,
        controller: &'a FakeController,
        dataplane: &'a FakeDataplane,
    ) -> Self {
        Self {
            hypervisor,
            controller,
            dataplane,
        }
    }

    /// The controller holds the interface under this display name.
    pub fn assert_interface(&self, uuid: &Uuid, display_name: &str) -> VerifyResult<()> {
        let vmi = self
            .controller
            .interface(uuid)
            .ok_or(VerificationError::Missing {
                kind: "interface",
                uuid: *uuid,
            })?;
        check(
            format!("display name of {}", uuid),
            display_name,
            vmi.display_name.as_str(),
        )
    }

    pub fn assert_no_interface(&self, uuid: &Uuid) -> VerifyResult<()> {
        match self.controller.interface(uuid) {
            Some(_) => Err(VerificationError::Unexpected {
                kind: "interface",
                uuid: *uuid,
            }),
            None => Ok(()),
        }
    }

    /// The agent has the port, tagged and with the admin state given.
    pub fn assert_port(&self, uuid: &Uuid, vlan: Option<VlanId>, enabled: bool) -> VerifyResult<()> {
        let port = self.dataplane.port(uuid).ok_or(VerificationError::Missing {
            kind: "port",
            uuid: *uuid,
        })?;
        check(format!("VLAN of port {}", uuid), vlan, port.vlan)?;
        check(
            format!("admin state of port {}", uuid),
            Some(enabled),
            self.dataplane.is_enabled(uuid),
        )
    }

    pub fn assert_no_port(&self, uuid: &Uuid) -> VerifyResult<()> {
        match self.dataplane.port(uuid) {
            Some(_) => Err(VerificationError::Unexpected {
                kind: "port",
                uuid: *uuid,
            }),
            None => Ok(()),
        }
    }

    /// The switch port carries this VLAN override.
    pub fn assert_vlan(&self, port: &PortRef, vlan: Option<VlanId>) -> VerifyResult<()> {
        check(format!("VLAN override of {}", port), vlan, self.hypervisor.vlan_of(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcm_common::{DataplaneApi, DataplanePort};

    #[tokio::test]
    async fn test_assert_port() {
        let hv = FakeHypervisor::new();
        let controller = FakeController::new();
        let dataplane = FakeDataplane::new();
        let uuid = Uuid::from_u128(1);

        let verifier = Verifier::new(&hv, &controller, &dataplane);
        assert!(verifier.assert_no_port(&uuid).is_ok());

        let port = DataplanePort {
            uuid,
            vm_uuid: Uuid::from_u128(2),
            vn_uuid: Uuid::from_u128(3),
            display_name: "vmi-DPG1-vm-1".to_string(),
            mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            ip: None,
            vlan: VlanId::new(5).ok(),
            port_key: "10".to_string(),
        };
        dataplane.add_port(&port).await.unwrap();
        dataplane.enable_port(&uuid).await.unwrap();

        assert!(verifier.assert_port(&uuid, VlanId::new(5).ok(), true).is_ok());
        assert!(verifier.assert_port(&uuid, VlanId::new(6).ok(), true).is_err());
        assert!(verifier.assert_port(&uuid, VlanId::new(5).ok(), false).is_err());
    }
}
