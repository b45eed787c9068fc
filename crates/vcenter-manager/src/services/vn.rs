//! Virtual network service: maps port groups onto controller networks.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use vcm_common::VcmResult;

use super::{Clients, Settings, SyncState};
use crate::config::VlanScope;
use crate::models::VirtualNetworkModel;

/// Resolves and caches the networks interfaces attach to.
///
/// Networks are provisioned in the controller by someone else; this
/// service never creates or deletes them.
#[derive(Clone)]
pub struct VnService {
    clients: Clients,
    settings: Arc<Settings>,
}

impl VnService {
    pub fn new(clients: Clients, settings: Arc<Settings>) -> Self {
        Self { clients, settings }
    }

    /// Resolves the network behind a port group.
    ///
    /// Returns `Ok(None)` when the port group is not ours to manage: it no
    /// longer exists, or the controller has no network of the same name.
    #[instrument(skip(self, state))]
    pub async fn resolve_for_key(
        &self,
        state: &mut SyncState,
        port_group_key: &str,
    ) -> VcmResult<Option<Uuid>> {
        if let Some(vn) = state.db.get_vn_by_key(port_group_key) {
            return Ok(Some(vn.uuid));
        }

        let Some(port_group) = self
            .clients
            .hypervisor
            .get_port_group(port_group_key)
            .await?
        else {
            debug!("port group not found, unmanaged");
            return Ok(None);
        };

        let project = state.project()?;
        let Some(network) = self
            .clients
            .controller
            .read_network_by_name(&project.project, &port_group.name)
            .await?
        else {
            debug!(name = %port_group.name, "no controller network for port group, unmanaged");
            return Ok(None);
        };

        self.clients
            .hypervisor
            .enable_vlan_override(port_group_key)
            .await?;

        let mut vn = VirtualNetworkModel::new(
            port_group_key,
            &port_group.name,
            network.uuid,
            network.external_ipam,
        );

        if self.settings.vlan_scope == VlanScope::PerNetwork {
            let mut pool = self.settings.new_vlan_pool();
            for reservation in self
                .clients
                .hypervisor
                .get_reserved_vlans_on_port_group(port_group_key)
                .await?
            {
                for id in reservation.ids() {
                    pool.reserve(id);
                }
            }
            debug!(reserved = pool.reserved_count(), "seeded network VLAN pool");
            vn.vlan_pool = Some(pool);
        }

        info!(
            network = %vn.name,
            vn = %vn.uuid,
            external_ipam = vn.external_ipam,
            "Managing network"
        );
        let uuid = vn.uuid;
        state.db.save(vn);
        Ok(Some(uuid))
    }

    /// Reconciles the cache with the controller's networks in the project.
    ///
    /// Every controller network whose port group still exists is cached;
    /// cached networks whose port group or controller network vanished are
    /// dropped from the cache.
    #[instrument(skip(self, state))]
    pub async fn sweep(&self, state: &mut SyncState) -> VcmResult<()> {
        let project = state.project()?;
        let networks = self
            .clients
            .controller
            .list_networks(&project.project)
            .await?;

        let mut live = HashSet::new();
        for network in &networks {
            match self
                .clients
                .hypervisor
                .find_port_group(&network.name)
                .await?
            {
                Some(port_group) => {
                    if self.resolve_for_key(state, &port_group.key).await?.is_some() {
                        live.insert(port_group.key);
                    }
                }
                None => debug!(network = %network.name, "no port group for controller network"),
            }
        }

        let stale: Vec<Uuid> = state
            .db
            .vns()
            .filter(|vn| !live.contains(&vn.key))
            .map(|vn| vn.uuid)
            .collect();
        for uuid in stale {
            if let Some(vn) = state.db.delete_vn(&uuid) {
                info!(network = %vn.name, key = %vn.key, "Port group or network vanished, no longer managed");
            }
        }

        Ok(())
    }
}
