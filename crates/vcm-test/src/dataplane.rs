//! In-memory dataplane agent.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use uuid::Uuid;
use vcm_common::{DataplaneApi, DataplanePort, VcmError, VcmResult};

/// A call received by [`FakeDataplane`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataplaneOp {
    Add,
    Delete,
    Enable,
    Disable,
}

#[derive(Debug, Clone)]
struct PlumbedPort {
    port: DataplanePort,
    enabled: bool,
}

/// Agent port table. Adding an existing port replaces it; deleting or
/// toggling a missing one fails with `NotFound`.
#[derive(Default)]
pub struct FakeDataplane {
    ports: Mutex<BTreeMap<Uuid, PlumbedPort>>,
    calls: Mutex<Vec<(DataplaneOp, Uuid)>>,
}

impl FakeDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(&self, uuid: &Uuid) -> Option<DataplanePort> {
        self.ports.lock().get(uuid).map(|p| p.port.clone())
    }

    pub fn ports(&self) -> Vec<DataplanePort> {
        self.ports.lock().values().map(|p| p.port.clone()).collect()
    }

    /// Admin state of a port, `None` if the port does not exist.
    pub fn is_enabled(&self, uuid: &Uuid) -> Option<bool> {
        self.ports.lock().get(uuid).map(|p| p.enabled)
    }

    pub fn calls(&self) -> Vec<(DataplaneOp, Uuid)> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn count(&self, op: DataplaneOp) -> usize {
        self.calls.lock().iter().filter(|(o, _)| *o == op).count()
    }

    fn record(&self, op: DataplaneOp, uuid: Uuid) {
        self.calls.lock().push((op, uuid));
    }

    fn set_enabled(&self, uuid: &Uuid, enabled: bool) -> VcmResult<()> {
        match self.ports.lock().get_mut(uuid) {
            Some(port) => {
                port.enabled = enabled;
                Ok(())
            }
            None => Err(VcmError::not_found("port", uuid)),
        }
    }
}

#[async_trait]
impl DataplaneApi for FakeDataplane {
    async fn add_port(&self, port: &DataplanePort) -> VcmResult<()> {
        self.record(DataplaneOp::Add, port.uuid);
        self.ports.lock().insert(
            port.uuid,
            PlumbedPort {
                port: port.clone(),
                enabled: false,
            },
        );
        Ok(())
    }

    async fn delete_port(&self, uuid: &Uuid) -> VcmResult<()> {
        self.record(DataplaneOp::Delete, *uuid);
        self.ports
            .lock()
            .remove(uuid)
            .map(|_| ())
            .ok_or_else(|| VcmError::not_found("port", uuid))
    }

    async fn enable_port(&self, uuid: &Uuid) -> VcmResult<()> {
        self.record(DataplaneOp::Enable, *uuid);
        self.set_enabled(uuid, true)
    }

    async fn disable_port(&self, uuid: &Uuid) -> VcmResult<()> {
        self.record(DataplaneOp::Disable, *uuid);
        self.set_enabled(uuid, false)
    }

    async fn read_port(&self, uuid: &Uuid) -> VcmResult<Option<DataplanePort>> {
        Ok(self.port(uuid))
    }
}
