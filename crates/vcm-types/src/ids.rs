//! Deterministic identities.
//!
//! Networks, interfaces and instance IPs get name-based (v5) UUIDs so that
//! the same hypervisor object always maps to the same controller object,
//! across restarts and across managers running on different hosts, without
//! a mapping table.

use uuid::Uuid;

/// Namespace for every UUID derived by this crate.
pub const NAMESPACE: Uuid = Uuid::from_u128(0x6f2c_5d0e_8a4b_4f7e_9c31_b2a9_e4d5_0c17);

/// UUID of the virtual network backed by the given port-group key.
pub fn network_uuid(port_group_key: &str) -> Uuid {
    Uuid::new_v5(&NAMESPACE, format!("network:{}", port_group_key).as_bytes())
}

/// UUID of the interface connecting `vm_uuid` to `vn_uuid`.
pub fn interface_uuid(vm_uuid: &Uuid, vn_uuid: &Uuid) -> Uuid {
    let mut name = Vec::with_capacity(32);
    name.extend_from_slice(vm_uuid.as_bytes());
    name.extend_from_slice(vn_uuid.as_bytes());
    Uuid::new_v5(&NAMESPACE, &name)
}

/// UUID of the instance IP attached to the given interface.
pub fn instance_ip_uuid(vmi_uuid: &Uuid) -> Uuid {
    Uuid::new_v5(&NAMESPACE, format!("instance-ip:{}", vmi_uuid).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_network_uuid_is_stable() {
        assert_eq!(network_uuid("dvportgroup-1"), network_uuid("dvportgroup-1"));
        assert_ne!(network_uuid("dvportgroup-1"), network_uuid("dvportgroup-2"));
    }

    #[test]
    fn test_interface_uuid_depends_on_both_sides() {
        let vm_a = Uuid::from_u128(1);
        let vm_b = Uuid::from_u128(2);
        let vn = network_uuid("dvportgroup-1");

        assert_eq!(interface_uuid(&vm_a, &vn), interface_uuid(&vm_a, &vn));
        assert_ne!(interface_uuid(&vm_a, &vn), interface_uuid(&vm_b, &vn));
        assert_ne!(interface_uuid(&vm_a, &vn), interface_uuid(&vn, &vm_a));
    }

    #[test]
    fn test_instance_ip_uuid_differs_from_interface() {
        let vmi = interface_uuid(&Uuid::from_u128(1), &network_uuid("dvportgroup-1"));
        assert_ne!(instance_ip_uuid(&vmi), vmi);
        assert_eq!(instance_ip_uuid(&vmi), instance_ip_uuid(&vmi));
    }
}
