//! Value types shared by the vCenter manager crates.
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses as reported by the hypervisor
//! - [`VlanId`]: VLAN tag usable as a per-port override (0-4094)
//! - [`PowerState`] / [`ToolsStatus`]: VM runtime state as reported by the hypervisor
//! - [`ids`]: deterministic identity derivation for networks, interfaces and instance IPs

pub mod ids;
mod mac;
mod state;
mod vlan;

pub use mac::MacAddress;
pub use state::{AdminState, PowerState, ToolsStatus};
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 0-4094)")]
    InvalidVlanId(u16),

    #[error("invalid power state: {0}")]
    InvalidPowerState(String),
}
