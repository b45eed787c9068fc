//! Supervisor restarts against the fake hypervisor, with short real timers.

mod common;

use common::{settings, MAC, PG_KEY, PG_NAME};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vcenter_manager::{Clients, Dispatcher, EventMonitor, Reconciler, Supervisor};
use vcm_common::{Backoff, EventKind, VcmResult, VmHandle};
use vcm_test::{
    event, events_batch, FakeController, FakeDataplane, FakeHypervisor, HypervisorCall,
    ProbeMode, VmBuilder, DOMAIN, PROJECT,
};

const VM_UUID: Uuid = Uuid::from_u128(0x7001);

struct Setup {
    hv: Arc<FakeHypervisor>,
    controller: Arc<FakeController>,
    supervisor: Supervisor,
}

fn setup() -> Setup {
    let hv = Arc::new(FakeHypervisor::new());
    let controller = Arc::new(FakeController::new());
    let dataplane = Arc::new(FakeDataplane::new());
    hv.add_port_group(PG_KEY, PG_NAME);
    controller.add_network(DOMAIN, PROJECT, PG_NAME, false);

    let clients = Clients::new(hv.clone(), controller.clone(), dataplane);
    let reconciler = Arc::new(Mutex::new(Reconciler::new(clients, Arc::new(settings()))));
    let monitor = EventMonitor::new(
        hv.clone(),
        reconciler,
        Arc::new(Dispatcher::with_default_handlers()),
    );
    let supervisor = Supervisor::new(
        hv.clone(),
        Arc::new(monitor),
        Duration::from_millis(50),
        Duration::from_millis(20),
        Backoff::new(Duration::from_millis(10), Duration::from_millis(40), 2),
    );

    Setup {
        hv,
        controller,
        supervisor,
    }
}

fn start(mut supervisor: Supervisor, token: CancellationToken) -> JoinHandle<(VcmResult<()>, Supervisor)> {
    tokio::spawn(async move {
        let result = supervisor.run(token).await;
        (result, supervisor)
    })
}

/// Polls until `condition` holds, failing the test after two seconds.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn reconnects(hv: &FakeHypervisor) -> usize {
    hv.count(|call| *call == HypervisorCall::Reconnect)
}

#[tokio::test]
async fn test_shutdown_while_healthy() {
    let Setup { hv, supervisor, .. } = setup();
    let token = CancellationToken::new();
    let task = start(supervisor, token.clone());

    wait_until("a few probes", || {
        hv.count(|call| *call == HypervisorCall::Probe) >= 3
    })
    .await;
    token.cancel();

    let (result, supervisor) = task.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(supervisor.restarts(), 0);
    assert_eq!(reconnects(&hv), 0);
}

#[tokio::test]
async fn test_hung_probe_restarts_monitor() {
    let Setup { hv, supervisor, .. } = setup();
    hv.set_probe_mode(ProbeMode::Hang);
    let token = CancellationToken::new();
    let task = start(supervisor, token.clone());

    wait_until("a reconnect", || reconnects(&hv) >= 1).await;
    hv.set_probe_mode(ProbeMode::Ok);
    token.cancel();

    let (result, supervisor) = task.await.unwrap();
    assert!(result.is_ok());
    assert!(supervisor.restarts() >= 1);
}

#[tokio::test]
async fn test_lost_event_stream_restarts_monitor() {
    let Setup { hv, supervisor, .. } = setup();
    let token = CancellationToken::new();
    let task = start(supervisor, token.clone());

    hv.push_connection_loss();
    wait_until("a reconnect", || reconnects(&hv) >= 1).await;
    token.cancel();

    let (result, supervisor) = task.await.unwrap();
    assert!(result.is_ok());
    assert!(supervisor.restarts() >= 1);
}

#[tokio::test]
async fn test_reconnect_retries_until_login_succeeds() {
    let Setup { hv, supervisor, .. } = setup();
    hv.fail_reconnects(2);
    hv.set_probe_mode(ProbeMode::Fail);
    let token = CancellationToken::new();
    let task = start(supervisor, token.clone());

    wait_until("three reconnect attempts", || reconnects(&hv) >= 3).await;
    hv.set_probe_mode(ProbeMode::Ok);
    token.cancel();

    let (result, supervisor) = task.await.unwrap();
    assert!(result.is_ok());
    assert!(supervisor.restarts() >= 1);
}

#[tokio::test]
async fn test_restart_resyncs_inventory() {
    let Setup {
        hv,
        controller,
        supervisor,
    } = setup();
    let reconciler = supervisor.reconciler();
    let token = CancellationToken::new();
    let task = start(supervisor, token.clone());

    // A VM created while the event stream is down is picked up by the
    // full sync that follows the restart.
    wait_until("the first probe", || {
        hv.count(|call| *call == HypervisorCall::Probe) >= 1
    })
    .await;
    assert!(controller.vms().is_empty());
    hv.add_vm(
        &VmHandle::new("vm-1"),
        VmBuilder::new("vm-1", VM_UUID).nic(MAC, PG_KEY, "10").build(),
    );
    hv.push_connection_loss();

    wait_until("the VM to reach the controller", || controller.vm(&VM_UUID).is_some()).await;
    token.cancel();
    let (result, supervisor) = task.await.unwrap();
    assert!(result.is_ok());
    assert!(supervisor.restarts() >= 1);

    let reconciler = reconciler.lock().await;
    assert!(reconciler.state.db.get_vm(&VM_UUID).is_some());
}

#[tokio::test]
async fn test_monitor_applies_pushed_batches() {
    let Setup {
        hv,
        controller,
        supervisor,
    } = setup();
    let token = CancellationToken::new();
    let task = start(supervisor, token.clone());

    let handle = VmHandle::new("vm-1");
    hv.add_vm(
        &handle,
        VmBuilder::new("vm-1", VM_UUID).nic(MAC, PG_KEY, "10").build(),
    );
    hv.push_batch(events_batch(vec![event(EventKind::Created, &handle, "vm-1")]));

    wait_until("the VM to reach the controller", || controller.vm(&VM_UUID).is_some()).await;
    token.cancel();
    let (result, supervisor) = task.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(supervisor.restarts(), 0);
}
