//! Test infrastructure for the vCenter manager.
//!
//! Provides:
//! - In-memory fakes of the hypervisor, the SDN controller and the
//!   dataplane agent that record every mutating call
//! - Builders for VM inventories and controller networks
//! - Verification helpers over the fakes' recorded state

mod controller;
mod dataplane;
pub mod fixtures;
mod hypervisor;
mod verification;

pub use controller::{ControllerOp, FakeController};
pub use dataplane::{DataplaneOp, FakeDataplane};
pub use fixtures::*;
pub use hypervisor::{FakeHypervisor, HypervisorCall, ProbeMode};
pub use verification::*;
