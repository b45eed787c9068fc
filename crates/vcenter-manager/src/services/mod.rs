//! Reconciliation services, one per entity type.
//!
//! Services hold no entity state of their own: every method takes the
//! [`SyncState`] it mutates, which the caller holds under the manager's
//! single lock.

mod port;
mod vm;
mod vmi;
mod vn;

pub use port::PortService;
pub use vm::VmService;
pub use vmi::VmiService;
pub use vn::VnService;

use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;
use vcm_common::{
    ControllerApi, ControllerInterface, ControllerVm, DataplaneApi, HypervisorApi, VcmError,
    VcmResult,
};
use vcm_types::VlanId;

use crate::config::{ManagerConfig, VlanScope};
use crate::store::Database;
use crate::vlan_pool::VlanIdPool;

/// The three external systems.
#[derive(Clone)]
pub struct Clients {
    pub hypervisor: Arc<dyn HypervisorApi>,
    pub controller: Arc<dyn ControllerApi>,
    pub dataplane: Arc<dyn DataplaneApi>,
}

impl Clients {
    pub fn new(
        hypervisor: Arc<dyn HypervisorApi>,
        controller: Arc<dyn ControllerApi>,
        dataplane: Arc<dyn DataplaneApi>,
    ) -> Self {
        Self {
            hypervisor,
            controller,
            dataplane,
        }
    }
}

/// The part of the configuration the services act on.
#[derive(Debug, Clone)]
pub struct Settings {
    pub local_host: String,
    pub agent_vm_prefix: String,
    pub domain: String,
    pub project: String,
    pub security_group: String,
    pub ipam: String,
    pub vlan_scope: VlanScope,
    pub vlan_range: (VlanId, VlanId),
}

impl Settings {
    pub fn from_config(config: &ManagerConfig) -> VcmResult<Self> {
        Ok(Self {
            local_host: config.hypervisor.local_host.clone(),
            agent_vm_prefix: config.hypervisor.agent_vm_prefix.clone(),
            domain: config.controller.domain.clone(),
            project: config.controller.project.clone(),
            security_group: config.controller.security_group.clone(),
            ipam: config.controller.ipam.clone(),
            vlan_scope: config.sync.vlan_scope,
            vlan_range: config.vlan_range()?,
        })
    }

    /// A fresh pool covering the configured range.
    pub fn new_vlan_pool(&self) -> VlanIdPool {
        VlanIdPool::new(self.vlan_range.0, self.vlan_range.1)
    }
}

impl Default for Settings {
    fn default() -> Self {
        let config = ManagerConfig::default();
        Self {
            local_host: config.hypervisor.local_host,
            agent_vm_prefix: config.hypervisor.agent_vm_prefix,
            domain: config.controller.domain,
            project: config.controller.project,
            security_group: config.controller.security_group,
            ipam: config.controller.ipam,
            vlan_scope: config.sync.vlan_scope,
            vlan_range: (VlanId::FIRST, VlanId::LAST),
        }
    }
}

/// Controller objects every managed object hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectContext {
    pub project: Uuid,
    pub security_group: Uuid,
    pub ipam: Uuid,
}

/// Everything the services mutate.
#[derive(Debug)]
pub struct SyncState {
    pub db: Database,
    /// Host-wide pool; used for every network unless VLANs are scoped per network.
    pub vlan_pool: VlanIdPool,
    project: Option<ProjectContext>,
}

impl SyncState {
    pub fn new(vlan_pool: VlanIdPool) -> Self {
        Self {
            db: Database::new(),
            vlan_pool,
            project: None,
        }
    }

    /// Project context, available once bootstrap has run.
    pub fn project(&self) -> VcmResult<ProjectContext> {
        self.project
            .ok_or_else(|| VcmError::internal("controller project not bootstrapped"))
    }

    pub fn set_project(&mut self, project: ProjectContext) {
        self.project = Some(project);
    }

    /// The pool VLAN ids of interfaces on `vn_uuid` come from.
    pub fn pool_for(&mut self, vn_uuid: &Uuid) -> &mut VlanIdPool {
        match self.db.vn_vlan_pool_mut(vn_uuid) {
            Some(pool) => pool,
            None => &mut self.vlan_pool,
        }
    }

    /// Whether an interface other than `vmi_uuid` sharing a VLAN pool with
    /// `vn_uuid` holds `tag`.
    pub fn vlan_held_by_other(&self, vn_uuid: &Uuid, vmi_uuid: &Uuid, tag: VlanId) -> bool {
        let per_network = self
            .db
            .get_vn(vn_uuid)
            .is_some_and(|vn| vn.vlan_pool.is_some());
        self.db
            .vmis()
            .filter(|other| !per_network || other.vn_uuid == *vn_uuid)
            .any(|other| other.uuid != *vmi_uuid && other.vlan_id == Some(tag))
    }

    /// Forgets every entity, pending entry and reservation.
    pub fn reset(&mut self, vlan_pool: VlanIdPool) {
        self.db.clear();
        self.vlan_pool = vlan_pool;
        self.project = None;
    }
}

/// Decides the fate of a queue entry whose work failed.
///
/// A lost connection aborts the drain, leaving the entry queued. Anything
/// else is logged and the entry dropped; the next full sync rebuilds it.
pub(crate) fn drain_error(kind: &str, id: &Uuid, err: VcmError) -> VcmResult<()> {
    if err.is_connection_lost() {
        return Err(err);
    }
    if err.is_stale() {
        warn!(%id, error = %err, "{}: stale reference, skipping", kind);
    } else {
        error!(%id, error = %err, "{} failed, dropping", kind);
    }
    Ok(())
}

/// Maps `NotFound` on a delete to success.
pub(crate) fn ignore_not_found(result: VcmResult<()>, kind: &str, id: &Uuid) -> VcmResult<()> {
    match result {
        Err(e) if e.is_not_found() => {
            debug!(%id, "{} already absent", kind);
            Ok(())
        }
        other => other,
    }
}

/// Update, falling back to create; a racing create counts as success.
pub(crate) async fn upsert_vm(
    controller: &dyn ControllerApi,
    vm: &ControllerVm,
) -> VcmResult<()> {
    match controller.update_vm(vm).await {
        Err(e) if e.is_not_found() => match controller.create_vm(vm).await {
            Err(e) if e.is_already_exists() => {
                debug!(vm = %vm.uuid, "VM created concurrently");
                Ok(())
            }
            other => other,
        },
        other => other,
    }
}

/// Update, falling back to create; a racing create counts as success.
pub(crate) async fn upsert_interface(
    controller: &dyn ControllerApi,
    vmi: &ControllerInterface,
) -> VcmResult<()> {
    match controller.update_interface(vmi).await {
        Err(e) if e.is_not_found() => match controller.create_interface(vmi).await {
            Err(e) if e.is_already_exists() => {
                debug!(vmi = %vmi.uuid, "interface created concurrently");
                Ok(())
            }
            other => other,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VirtualNetworkModel;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pool_for_falls_back_to_global() {
        let mut state = SyncState::new(VlanIdPool::default());
        let vn = VirtualNetworkModel::new("dvportgroup-1", "DPG1", Uuid::from_u128(1), false);
        let vn_uuid = vn.uuid;
        state.db.save(vn);

        let id = state.pool_for(&vn_uuid).get_available().unwrap();
        assert!(!state.vlan_pool.is_available(id));
    }

    #[test]
    fn test_pool_for_uses_network_pool() {
        let mut state = SyncState::new(VlanIdPool::default());
        let mut vn = VirtualNetworkModel::new("dvportgroup-1", "DPG1", Uuid::from_u128(1), false);
        vn.vlan_pool = Some(VlanIdPool::default());
        let vn_uuid = vn.uuid;
        state.db.save(vn);

        let id = state.pool_for(&vn_uuid).get_available().unwrap();
        assert!(state.vlan_pool.is_available(id));
        let network_pool = state.db.get_vn(&vn_uuid).unwrap().vlan_pool.as_ref().unwrap();
        assert_eq!(network_pool.reserved_count(), 1);
    }

    #[test]
    fn test_project_requires_bootstrap() {
        let mut state = SyncState::new(VlanIdPool::default());
        assert!(state.project().is_err());

        let ctx = ProjectContext {
            project: Uuid::from_u128(1),
            security_group: Uuid::from_u128(2),
            ipam: Uuid::from_u128(3),
        };
        state.set_project(ctx);
        assert_eq!(state.project().unwrap(), ctx);
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = ManagerConfig::default();
        config.sync.vlan_start = 100;
        config.sync.vlan_end = 200;
        let settings = Settings::from_config(&config).unwrap();
        assert_eq!(settings.new_vlan_pool().range().0.as_u16(), 100);
        assert_eq!(settings.local_host, "localhost");
    }
}
