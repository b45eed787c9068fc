//! Change handlers: one per kind of property change the manager reacts to.
//!
//! Each handler declares the property it watches and translates a change
//! of that property into service calls, then drains the pending queues.

use async_trait::async_trait;
use tracing::{debug, error, instrument, warn};
use vcm_common::{
    EventKind, HypervisorEvent, PropertyChange, PropertyValue, VcmError, VcmResult, VmHandle,
    PROP_GUEST_NET, PROP_LATEST_PAGE, PROP_POWER_STATE, PROP_TOOLS_STATUS,
};
use vcm_types::{ParseError, ToolsStatus};

use crate::models::RemovalMode;
use crate::reconciler::Reconciler;

/// Reacts to changes of one property.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Property name prefix this handler is dispatched for.
    fn watched(&self) -> &'static str;

    /// Applies one change of `object`. Runs under the manager's lock.
    async fn handle(
        &self,
        reconciler: &mut Reconciler,
        object: &VmHandle,
        change: &PropertyChange,
    ) -> VcmResult<()>;
}

/// The built-in handlers, in dispatch order.
pub fn default_handlers() -> Vec<Box<dyn ChangeHandler>> {
    vec![
        Box::new(VmUpdatedHandler),
        Box::new(VmRenamedHandler),
        Box::new(VmRemovedHandler),
        Box::new(GuestNetHandler),
        Box::new(ToolsStatusHandler),
        Box::new(PowerStateHandler),
    ]
}

/// Events in a `latestPage` change.
fn events(change: &PropertyChange) -> &[HypervisorEvent] {
    match &change.value {
        PropertyValue::Events(events) => events,
        _ => &[],
    }
}

/// Keeps one failed event from spoiling the rest of its page.
fn event_error(handler: &str, event: &HypervisorEvent, err: VcmError) -> VcmResult<()> {
    if err.is_connection_lost() {
        return Err(err);
    }
    if err.is_stale() {
        warn!(handler, vm = %event.vm_name, error = %err, "VM vanished while handling event");
    } else {
        error!(handler, vm = %event.vm_name, kind = ?event.kind, error = %err, "Failed to handle event");
    }
    Ok(())
}

async fn flush(reconciler: &mut Reconciler) -> VcmResult<()> {
    reconciler.services.flush(&mut reconciler.state).await
}

/// Re-reads VMs after events that can change their configuration:
/// creation, reconfiguration, migration and power-on.
pub struct VmUpdatedHandler;

#[async_trait]
impl ChangeHandler for VmUpdatedHandler {
    fn name(&self) -> &'static str {
        "vm-updated"
    }

    fn watched(&self) -> &'static str {
        PROP_LATEST_PAGE
    }

    async fn handle(
        &self,
        reconciler: &mut Reconciler,
        _object: &VmHandle,
        change: &PropertyChange,
    ) -> VcmResult<()> {
        for event in events(change).iter().filter(|e| e.kind.requires_observe()) {
            let Some(vm) = &event.vm else {
                debug!(vm = %event.vm_name, kind = ?event.kind, "event has no VM reference");
                continue;
            };
            if let Err(e) = reconciler
                .services
                .vm
                .observe(&mut reconciler.state, vm)
                .await
            {
                event_error(self.name(), event, e)?;
            }
        }
        flush(reconciler).await
    }
}

pub struct VmRenamedHandler;

#[async_trait]
impl ChangeHandler for VmRenamedHandler {
    fn name(&self) -> &'static str {
        "vm-renamed"
    }

    fn watched(&self) -> &'static str {
        PROP_LATEST_PAGE
    }

    async fn handle(
        &self,
        reconciler: &mut Reconciler,
        _object: &VmHandle,
        change: &PropertyChange,
    ) -> VcmResult<()> {
        for event in events(change).iter().filter(|e| e.kind == EventKind::Renamed) {
            let Some(new_name) = &event.new_name else {
                continue;
            };
            if let Err(e) = reconciler
                .services
                .vm
                .rename(&mut reconciler.state, &event.vm_name, new_name)
                .await
            {
                event_error(self.name(), event, e)?;
            }
        }
        flush(reconciler).await
    }
}

/// Removes VMs on removal events. The controller VM goes last, once its
/// interfaces are gone.
pub struct VmRemovedHandler;

#[async_trait]
impl ChangeHandler for VmRemovedHandler {
    fn name(&self) -> &'static str {
        "vm-removed"
    }

    fn watched(&self) -> &'static str {
        PROP_LATEST_PAGE
    }

    async fn handle(
        &self,
        reconciler: &mut Reconciler,
        _object: &VmHandle,
        change: &PropertyChange,
    ) -> VcmResult<()> {
        for event in events(change).iter().filter(|e| e.kind == EventKind::Removed) {
            let removed = match reconciler
                .services
                .vm
                .remove(&mut reconciler.state, &event.vm_name)
                .await
            {
                Ok(removed) => removed,
                Err(e) => {
                    event_error(self.name(), event, e)?;
                    continue;
                }
            };
            flush(reconciler).await?;

            if let Some(removed) = removed.filter(|r| r.mode == RemovalMode::Full) {
                if let Err(e) = reconciler
                    .services
                    .vm
                    .delete_from_controller(&removed.uuid)
                    .await
                {
                    event_error(self.name(), event, e)?;
                }
            }
        }
        flush(reconciler).await
    }
}

/// Feeds guest-reported addresses to interfaces on externally managed
/// networks.
pub struct GuestNetHandler;

#[async_trait]
impl ChangeHandler for GuestNetHandler {
    fn name(&self) -> &'static str {
        "guest-net"
    }

    fn watched(&self) -> &'static str {
        PROP_GUEST_NET
    }

    #[instrument(skip(self, reconciler, change), fields(vm = %object))]
    async fn handle(
        &self,
        reconciler: &mut Reconciler,
        object: &VmHandle,
        change: &PropertyChange,
    ) -> VcmResult<()> {
        let PropertyValue::GuestNics(nics) = &change.value else {
            debug!("unexpected guest.net value");
            return Ok(());
        };
        if reconciler.state.db.get_vm_by_handle(object).is_none() {
            return Ok(());
        }

        for nic in nics.iter().filter(|nic| !nic.mac.is_zero()) {
            let Some(ip) = nic.primary_ip() else {
                continue;
            };
            reconciler
                .services
                .vmi
                .update_guest_ip(&mut reconciler.state, &nic.mac, ip)
                .await?;
        }
        flush(reconciler).await
    }
}

pub struct ToolsStatusHandler;

#[async_trait]
impl ChangeHandler for ToolsStatusHandler {
    fn name(&self) -> &'static str {
        "tools-status"
    }

    fn watched(&self) -> &'static str {
        PROP_TOOLS_STATUS
    }

    async fn handle(
        &self,
        reconciler: &mut Reconciler,
        object: &VmHandle,
        change: &PropertyChange,
    ) -> VcmResult<()> {
        let status = match &change.value {
            PropertyValue::ToolsStatus(status) => *status,
            PropertyValue::Text(text) => ToolsStatus::from_hypervisor(text),
            _ => return Ok(()),
        };
        reconciler
            .services
            .vm
            .update_tools_running(&mut reconciler.state, object, status);
        flush(reconciler).await
    }
}

/// Follows power state changes; the dataplane port's admin state tracks it.
pub struct PowerStateHandler;

#[async_trait]
impl ChangeHandler for PowerStateHandler {
    fn name(&self) -> &'static str {
        "power-state"
    }

    fn watched(&self) -> &'static str {
        PROP_POWER_STATE
    }

    async fn handle(
        &self,
        reconciler: &mut Reconciler,
        object: &VmHandle,
        change: &PropertyChange,
    ) -> VcmResult<()> {
        let power_state = match &change.value {
            PropertyValue::PowerState(state) => *state,
            PropertyValue::Text(text) => text.parse().map_err(|e: ParseError| {
                VcmError::serialization(format!("power state of {}: {}", object, e))
            })?,
            _ => return Ok(()),
        };
        reconciler
            .services
            .vm
            .update_power_state(&mut reconciler.state, object, power_state);
        flush(reconciler).await
    }
}
