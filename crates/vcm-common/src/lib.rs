//! Common abstractions for the vCenter manager.
//!
//! This crate provides the types shared by the reconciliation engine and
//! the clients it drives:
//!
//! - [`VcmError`]: error taxonomy, classified by how each failure is recovered
//! - [`HypervisorApi`], [`ControllerApi`], [`DataplaneApi`]: contracts of the
//!   three external systems and their wire types
//! - [`PendingQueue`]: idempotent, insertion-ordered work queue
//! - [`Backoff`]: exponential delay for reconnect attempts
//!
//! # Architecture
//!
//! The manager is event driven:
//!
//! 1. The hypervisor delivers batches of property changes
//! 2. Change handlers translate each change into service calls
//! 3. Services mutate the in-memory store and enqueue pending work
//! 4. Draining the queues pushes the changes to the controller and the
//!    dataplane agent
//!
//! Nothing is persisted; a restart rebuilds the store with a full sync.

mod controller;
mod dataplane;
mod error;
mod hypervisor;
mod queue;
mod retry;

pub use controller::{
    ControllerApi, ControllerInstanceIp, ControllerInterface, ControllerNetwork, ControllerVm,
};
pub use dataplane::{DataplaneApi, DataplanePort};
pub use error::{VcmError, VcmResult};
pub use hypervisor::{
    ChangeBatch, EventKind, GuestNic, HypervisorApi, HypervisorEvent, NetworkDevice,
    ObjectUpdate, PortGroup, PortRef, PropertyChange, PropertyValue, SubscriptionHandle,
    VlanReservation, VmHandle, VmLocation, VmProperties, PROP_GUEST_NET, PROP_LATEST_PAGE,
    PROP_POWER_STATE, PROP_TOOLS_STATUS, VM_SUBSCRIPTION_FILTERS,
};
pub use queue::PendingQueue;
pub use retry::Backoff;
