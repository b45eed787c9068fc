//! Dataplane port service.

use tracing::{debug, info, instrument};
use uuid::Uuid;
use vcm_common::VcmResult;
use vcm_types::AdminState;

use super::{drain_error, ignore_not_found, Clients, SyncState};

/// Pushes interfaces to the dataplane agent's port table.
#[derive(Clone)]
pub struct PortService {
    clients: Clients,
}

/// Outcome of pushing one port.
enum Pushed {
    Done,
    /// The interface left the store; nothing to push.
    Gone,
}

impl PortService {
    pub fn new(clients: Clients) -> Self {
        Self { clients }
    }

    /// Drains pending port deletes, then pending upserts.
    ///
    /// Upserts run in two passes: the first brings each port's content in
    /// line with its interface, the second sets every port's admin state
    /// from its VM's power state, whether or not the content changed.
    pub async fn reconcile_pending(&self, state: &mut SyncState) -> VcmResult<()> {
        for (uuid, ()) in state.db.dataplane_ports_pending_delete.snapshot() {
            let result = ignore_not_found(
                self.clients.dataplane.delete_port(&uuid).await,
                "dataplane port",
                &uuid,
            );
            match result {
                Ok(()) => info!(port = %uuid, "Deleted dataplane port"),
                Err(e) => drain_error("port delete", &uuid, e)?,
            }
            state.db.dataplane_ports_pending_delete.complete(&uuid);
        }

        let pending = state.db.dataplane_ports_pending_upsert.snapshot();
        let mut pushed = Vec::with_capacity(pending.len());
        for (uuid, ()) in &pending {
            match self.push(state, uuid).await {
                Ok(Pushed::Done) => pushed.push(*uuid),
                Ok(Pushed::Gone) => {}
                Err(e) => drain_error("port upsert", uuid, e)?,
            }
        }

        for uuid in &pushed {
            if let Err(e) = self.apply_admin_state(state, uuid).await {
                drain_error("port admin state", uuid, e)?;
            }
        }

        for (uuid, ()) in &pending {
            state.db.dataplane_ports_pending_upsert.complete(uuid);
        }
        Ok(())
    }

    /// Adds the port, replacing a port whose binding differs. An identical
    /// port is left alone.
    #[instrument(skip(self, state))]
    async fn push(&self, state: &SyncState, uuid: &Uuid) -> VcmResult<Pushed> {
        let Some(vmi) = state.db.get_vmi(uuid) else {
            debug!("interface gone, skipping port");
            return Ok(Pushed::Gone);
        };
        let desired = vmi.to_dataplane();
        let dataplane = self.clients.dataplane.as_ref();

        match dataplane.read_port(uuid).await? {
            Some(current) if current.same_binding(&desired) => {
                debug!("dataplane port up to date");
                return Ok(Pushed::Done);
            }
            Some(_) => {
                debug!("dataplane port changed, replacing");
                ignore_not_found(dataplane.delete_port(uuid).await, "dataplane port", uuid)?;
            }
            None => {}
        }

        dataplane.add_port(&desired).await?;
        info!(
            name = %desired.display_name,
            vlan = ?desired.vlan.map(|v| v.as_u16()),
            ip = ?desired.ip,
            "Added dataplane port"
        );
        Ok(Pushed::Done)
    }

    async fn apply_admin_state(&self, state: &SyncState, uuid: &Uuid) -> VcmResult<()> {
        let Some(vm_uuid) = state.db.get_vmi(uuid).map(|vmi| vmi.vm_uuid) else {
            return Ok(());
        };
        let Some(vm) = state.db.get_vm(&vm_uuid) else {
            return Ok(());
        };

        match vm.power_state.port_admin_state() {
            AdminState::Up => self.clients.dataplane.enable_port(uuid).await,
            AdminState::Down => self.clients.dataplane.disable_port(uuid).await,
        }
    }
}
