//! Composition root: the store plus the services that mutate it.

use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use vcm_common::VcmResult;

use crate::services::{
    Clients, PortService, ProjectContext, Settings, SyncState, VmService, VmiService, VnService,
};

/// The four reconciliation services, wired together.
#[derive(Clone)]
pub struct Services {
    pub vm: VmService,
    pub vn: VnService,
    pub vmi: VmiService,
    pub port: PortService,
}

impl Services {
    pub fn new(clients: Clients, settings: Arc<Settings>) -> Self {
        let vn = VnService::new(clients.clone(), settings.clone());
        Self {
            vm: VmService::new(clients.clone(), settings.clone()),
            vmi: VmiService::new(clients.clone(), settings, vn.clone()),
            vn,
            port: PortService::new(clients),
        }
    }

    /// Drains the pending queues in dependency order: interfaces first,
    /// since their changes feed the dataplane port queues.
    pub async fn flush(&self, state: &mut SyncState) -> VcmResult<()> {
        self.vmi.reconcile_pending(state).await?;
        self.port.reconcile_pending(state).await
    }
}

/// Owns all reconciliation state. Held behind the manager's single lock.
pub struct Reconciler {
    pub state: SyncState,
    pub services: Services,
    clients: Clients,
    settings: Arc<Settings>,
}

impl Reconciler {
    pub fn new(clients: Clients, settings: Arc<Settings>) -> Self {
        Self {
            state: SyncState::new(settings.new_vlan_pool()),
            services: Services::new(clients.clone(), settings.clone()),
            clients,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Makes sure the project, its security group and its IPAM exist in
    /// the controller.
    #[instrument(skip(self))]
    pub async fn bootstrap(&mut self) -> VcmResult<ProjectContext> {
        let controller = self.clients.controller.as_ref();
        let project = controller
            .ensure_project(&self.settings.domain, &self.settings.project)
            .await?;
        let security_group = controller
            .ensure_security_group(&project, &self.settings.security_group)
            .await?;
        let ipam = controller.ensure_ipam(&project, &self.settings.ipam).await?;

        let ctx = ProjectContext {
            project,
            security_group,
            ipam,
        };
        self.state.set_project(ctx);
        info!(%project, "Controller project ready");
        Ok(ctx)
    }

    /// Rebuilds all state from scratch.
    ///
    /// Runs on startup and after every reconnect. Everything learned
    /// before is discarded and the hypervisor's inventory read again.
    /// Every managed interface is pushed to the controller and the
    /// dataplane before controller objects nothing tracks are deleted.
    #[instrument(skip(self))]
    pub async fn full_sync(&mut self) -> VcmResult<()> {
        info!("Starting full synchronization");
        self.drop_subscriptions().await?;
        self.state.reset(self.settings.new_vlan_pool());

        self.bootstrap().await?;
        let services = &self.services;
        let state = &mut self.state;

        services.vn.sweep(state).await?;
        services.vmi.sync_vlan_ids(state).await?;

        let handles = self.clients.hypervisor.get_all_vms().await?;
        let mut managed = 0usize;
        for handle in &handles {
            match services.vm.observe(state, handle).await {
                Ok(Some(_)) => managed += 1,
                Ok(None) => {}
                Err(e) if e.is_connection_lost() => return Err(e),
                Err(e) if e.is_stale() => {
                    warn!(vm = %handle, error = %e, "VM vanished during sync, skipping")
                }
                Err(e) => error!(vm = %handle, error = %e, "Failed to sync VM"),
            }
        }

        services.flush(state).await?;

        // Sweeps compare against interfaces the flush above created.
        services.vmi.sweep(state).await?;
        services.vm.sweep(state).await?;
        services.flush(state).await?;

        info!(
            vms = managed,
            interfaces = state.db.vmis().count(),
            vlans = state.vlan_pool.reserved_count(),
            "Full synchronization complete"
        );
        Ok(())
    }

    /// Cancels the subscriptions of tracked VMs before they are forgotten.
    async fn drop_subscriptions(&mut self) -> VcmResult<()> {
        let subscriptions: Vec<_> = self.state.db.vms().filter_map(|vm| vm.subscription).collect();
        for subscription in subscriptions {
            match self.clients.hypervisor.unsubscribe(subscription).await {
                Ok(()) => {}
                Err(e) if e.is_connection_lost() => return Err(e),
                Err(e) => debug!(error = %e, "subscription already gone"),
            }
        }
        Ok(())
    }
}
