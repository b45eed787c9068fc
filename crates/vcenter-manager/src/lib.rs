//! vcenter-manager - keeps an SDN controller and a host's dataplane agent
//! in step with the VMs a vCenter hypervisor runs on that host.
//!
//! The manager mirrors hypervisor VMs, their NICs and the port groups they
//! attach to into an in-memory store, pushes the corresponding objects to
//! the controller, assigns each managed switch port a VLAN tag unique on
//! the host, and tells the dataplane agent which ports to plumb.
//!
//! All reconciliation happens under a single lock held by [`Reconciler`];
//! the [`EventMonitor`] waits for change batches outside of it, and the
//! [`Supervisor`] restarts the monitor when the hypervisor session dies.

pub mod config;
mod dispatcher;
pub mod handlers;
pub mod models;
mod monitor;
mod reconciler;
pub mod services;
pub mod store;
mod supervisor;
mod vlan_pool;

pub use config::ManagerConfig;
pub use dispatcher::Dispatcher;
pub use monitor::EventMonitor;
pub use reconciler::{Reconciler, Services};
pub use services::{Clients, Settings, SyncState};
pub use supervisor::Supervisor;
pub use vlan_pool::VlanIdPool;

use tokio_util::sync::CancellationToken;
use vcm_common::VcmResult;

/// Runs the manager against the given clients until `shutdown` fires.
pub async fn run(
    config: &ManagerConfig,
    clients: Clients,
    shutdown: CancellationToken,
) -> VcmResult<()> {
    Supervisor::from_config(config, clients)?.run(shutdown).await
}
