//! Change batches applied through the dispatcher.

mod common;

use common::{vmi_uuid, Harness, MAC, PG_KEY, PG_NAME};
use pretty_assertions::assert_eq;
use uuid::Uuid;
use vcm_common::{EventKind, HypervisorEvent, PortRef, PropertyValue, VmHandle};
use vcm_test::{
    event, events_batch, guest_nic, guest_net_batch, mac, power_batch, single_change,
    tools_batch, vlan, ControllerOp, DataplaneOp, HypervisorCall, VmBuilder, LOCAL_HOST, REMOTE_HOST,
};
use vcm_types::{PowerState, ToolsStatus};

const VM_UUID: Uuid = Uuid::from_u128(0x5001);

/// A synced harness with `vm-1` on DPG1, VLAN 2 on port 10.
async fn synced(external_ipam: bool) -> (Harness, VmHandle) {
    let mut h = Harness::new();
    h.add_network(PG_KEY, PG_NAME, external_ipam);
    h.hv.reserve_on_host(vcm_common::VlanReservation::Single(vlan(0)));
    h.hv.reserve_on_host(vcm_common::VlanReservation::Single(vlan(1)));
    let handle = h.add_vm("vm-1", VM_UUID, MAC, PG_KEY, "10");
    h.full_sync().await;
    h.clear_calls();
    (h, handle)
}

#[tokio::test]
async fn test_created_event_observes_vm() {
    let mut h = Harness::new();
    h.add_network(PG_KEY, PG_NAME, false);
    h.full_sync().await;

    let handle = h.add_vm("vm-1", VM_UUID, MAC, PG_KEY, "10");
    h.dispatch(events_batch(vec![event(EventKind::Created, &handle, "vm-1")]))
        .await
        .unwrap();

    let vmi = h.vmi(VM_UUID, PG_KEY).expect("interface created");
    assert_eq!(vmi.vlan_id, Some(vlan(0)));
    assert_eq!(h.dataplane.count(DataplaneOp::Add), 1);
    assert_eq!(h.dataplane.is_enabled(&vmi.uuid), Some(true));
    assert!(h
        .hv
        .calls()
        .contains(&HypervisorCall::Subscribe(handle.clone())));
}

#[tokio::test]
async fn test_removal_of_migrated_vm_is_local_only() {
    let (mut h, handle) = synced(false).await;
    let port = PortRef::new(PG_KEY, "10");
    h.hv.update_vm(&handle, |props| props.host = REMOTE_HOST.to_string());

    h.dispatch(events_batch(vec![event(EventKind::Removed, &handle, "vm-1")]))
        .await
        .unwrap();

    assert!(h.reconciler.state.db.get_vm(&VM_UUID).is_none());
    assert!(h.vmi(VM_UUID, PG_KEY).is_none());
    h.verifier()
        .assert_no_port(&vmi_uuid(VM_UUID, PG_KEY))
        .unwrap();
    assert_eq!(h.controller.count(ControllerOp::DeleteVm), 0);
    assert_eq!(h.controller.count(ControllerOp::DeleteInterface), 0);
    assert!(h.hv.set_vlan_calls().is_empty());
    assert_eq!(h.hv.vlan_of(&port), Some(vlan(2)));
    assert!(h.reconciler.state.vlan_pool.is_available(vlan(2)));
}

#[tokio::test]
async fn test_migration_event_forgets_vm_locally() {
    let (mut h, handle) = synced(false).await;
    h.hv.update_vm(&handle, |props| props.host = REMOTE_HOST.to_string());

    h.dispatch(events_batch(vec![event(EventKind::Migrated, &handle, "vm-1")]))
        .await
        .unwrap();

    assert!(h.reconciler.state.db.get_vm(&VM_UUID).is_none());
    assert_eq!(h.dataplane.count(DataplaneOp::Delete), 1);
    assert_eq!(h.controller.count(ControllerOp::DeleteVm), 0);
    assert_eq!(h.controller.count(ControllerOp::DeleteInterface), 0);
    assert!(h.hv.set_vlan_calls().is_empty());
    assert_eq!(h.hv.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_removal_of_deleted_vm_is_full() {
    let (mut h, handle) = synced(false).await;
    let port = PortRef::new(PG_KEY, "10");
    h.hv.remove_vm(&handle);

    h.dispatch(events_batch(vec![event(EventKind::Removed, &handle, "vm-1")]))
        .await
        .unwrap();

    let vmi = vmi_uuid(VM_UUID, PG_KEY);
    h.verifier().assert_no_interface(&vmi).unwrap();
    h.verifier().assert_no_port(&vmi).unwrap();
    assert!(h.controller.vm(&VM_UUID).is_none());
    assert!(h.controller.instance_ips().is_empty());
    assert_eq!(h.hv.set_vlan_calls(), vec![(port.clone(), None)]);
    h.verifier().assert_vlan(&port, None).unwrap();

    // Interfaces go before their VM.
    let calls = h.controller.calls();
    let interface_at = calls
        .iter()
        .position(|(op, _)| *op == ControllerOp::DeleteInterface)
        .unwrap();
    let vm_at = calls
        .iter()
        .position(|(op, _)| *op == ControllerOp::DeleteVm)
        .unwrap();
    assert!(interface_at < vm_at);
}

#[tokio::test]
async fn test_rename_blocked_by_remote_owner() {
    let (mut h, _handle) = synced(false).await;
    h.hv.add_remote_vm(Uuid::from_u128(0x9999), "vm-new", REMOTE_HOST);

    h.dispatch(events_batch(vec![HypervisorEvent::renamed(
        VmHandle::new("vm-1"),
        "vm-1",
        "vm-new",
    )]))
    .await
    .unwrap();

    assert_eq!(h.controller.count(ControllerOp::UpdateVm), 0);
    assert_eq!(h.controller.count(ControllerOp::CreateVm), 0);
    assert_eq!(h.controller.vm(&VM_UUID).unwrap().name, "vm-1");
    // Local state follows the hypervisor regardless.
    let vm = h.reconciler.state.db.get_vm(&VM_UUID).unwrap();
    assert_eq!(vm.name, "vm-new");
}

#[tokio::test]
async fn test_rename_seen_by_reconfigure_respects_remote_owner() {
    let (mut h, handle) = synced(false).await;
    h.hv.update_vm(&handle, |props| props.name = "vm-new".to_string());
    h.hv.add_remote_vm(Uuid::from_u128(0x9999), "vm-new", REMOTE_HOST);

    // vCenter reports a rename as a reconfigure and a rename in one page.
    h.dispatch(events_batch(vec![
        event(EventKind::Reconfigured, &handle, "vm-new"),
        HypervisorEvent::renamed(handle.clone(), "vm-1", "vm-new"),
    ]))
    .await
    .unwrap();

    assert_eq!(h.controller.count(ControllerOp::UpdateVm), 0);
    assert_eq!(h.controller.count(ControllerOp::UpdateInterface), 0);
    assert_eq!(h.controller.vm(&VM_UUID).unwrap().name, "vm-1");
    let vm = h.reconciler.state.db.get_vm(&VM_UUID).unwrap();
    assert_eq!(vm.name, "vm-new");
}

#[tokio::test]
async fn test_rename_seen_by_reconfigure_is_pushed() {
    let (mut h, handle) = synced(false).await;
    h.hv.update_vm(&handle, |props| props.name = "vm-2".to_string());

    h.dispatch(events_batch(vec![
        event(EventKind::Reconfigured, &handle, "vm-2"),
        HypervisorEvent::renamed(handle.clone(), "vm-1", "vm-2"),
    ]))
    .await
    .unwrap();

    assert_eq!(h.controller.vm(&VM_UUID).unwrap().name, "vm-2");
    h.verifier()
        .assert_interface(&vmi_uuid(VM_UUID, PG_KEY), "vmi-DPG1-vm-2")
        .unwrap();
}

#[tokio::test]
async fn test_rename_pushes_vm_and_interfaces() {
    let (mut h, _handle) = synced(false).await;

    h.dispatch(events_batch(vec![HypervisorEvent::renamed(
        VmHandle::new("vm-1"),
        "vm-1",
        "vm-2",
    )]))
    .await
    .unwrap();

    assert_eq!(h.controller.vm(&VM_UUID).unwrap().name, "vm-2");
    h.verifier()
        .assert_interface(&vmi_uuid(VM_UUID, PG_KEY), "vmi-DPG1-vm-2")
        .unwrap();
    assert!(h.reconciler.state.db.get_vm_by_name("vm-1").is_none());
    assert!(h.hv.set_vlan_calls().is_empty());
}

#[tokio::test]
async fn test_power_off_disables_port() {
    let (mut h, handle) = synced(false).await;
    let vmi = vmi_uuid(VM_UUID, PG_KEY);

    h.dispatch(power_batch(&handle, PowerState::PoweredOff))
        .await
        .unwrap();

    h.verifier().assert_port(&vmi, Some(vlan(2)), false).unwrap();
    assert_eq!(h.dataplane.count(DataplaneOp::Add), 0);
    assert_eq!(h.dataplane.count(DataplaneOp::Disable), 1);
    // No VLAN work on power-off.
    assert_eq!(h.controller.count(ControllerOp::UpdateInterface), 0);
}

#[tokio::test]
async fn test_power_on_reconfigures_and_enables() {
    let (mut h, handle) = synced(false).await;
    let vmi = vmi_uuid(VM_UUID, PG_KEY);
    h.dispatch(power_batch(&handle, PowerState::PoweredOff))
        .await
        .unwrap();
    h.clear_calls();

    h.dispatch(power_batch(&handle, PowerState::PoweredOn))
        .await
        .unwrap();

    h.verifier().assert_port(&vmi, Some(vlan(2)), true).unwrap();
    assert_eq!(h.controller.count(ControllerOp::UpdateInterface), 1);
    assert!(h.hv.set_vlan_calls().is_empty());
}

#[tokio::test]
async fn test_unchanged_power_state_is_ignored() {
    let (mut h, handle) = synced(false).await;

    h.dispatch(power_batch(&handle, PowerState::PoweredOn))
        .await
        .unwrap();

    assert!(h.dataplane.calls().is_empty());
    assert!(h.controller.calls().is_empty());
}

#[tokio::test]
async fn test_power_state_as_text() {
    let (mut h, handle) = synced(false).await;

    h.dispatch(single_change(
        handle.clone(),
        vcm_common::PROP_POWER_STATE,
        PropertyValue::Text("poweredOff".to_string()),
    ))
    .await
    .unwrap();

    let vm = h.reconciler.state.db.get_vm(&VM_UUID).unwrap();
    assert_eq!(vm.power_state, PowerState::PoweredOff);
}

#[tokio::test]
async fn test_unparseable_power_state_is_contained() {
    let (mut h, handle) = synced(false).await;

    h.dispatch(single_change(
        handle.clone(),
        vcm_common::PROP_POWER_STATE,
        PropertyValue::Text("halfOn".to_string()),
    ))
    .await
    .unwrap();

    let vm = h.reconciler.state.db.get_vm(&VM_UUID).unwrap();
    assert_eq!(vm.power_state, PowerState::PoweredOn);
    assert!(h.dataplane.calls().is_empty());
}

#[tokio::test]
async fn test_tools_status_recorded() {
    let (mut h, handle) = synced(false).await;
    h.dispatch(tools_batch(&handle, ToolsStatus::NotRunning))
        .await
        .unwrap();

    assert!(!h.reconciler.state.db.get_vm(&VM_UUID).unwrap().tools_running);
}

#[tokio::test]
async fn test_guest_ip_ignored_on_controller_ipam() {
    let (mut h, handle) = synced(false).await;
    let before = h.vmi(VM_UUID, PG_KEY).unwrap().ip_address;

    h.dispatch(guest_net_batch(&handle, vec![guest_nic(MAC, "192.168.1.5")]))
        .await
        .unwrap();

    assert_eq!(h.vmi(VM_UUID, PG_KEY).unwrap().ip_address, before);
    assert_eq!(h.controller.count(ControllerOp::UpdateInstanceIp), 0);
    assert!(h.dataplane.calls().is_empty());
}

#[tokio::test]
async fn test_guest_ip_on_external_ipam() {
    let (mut h, handle) = synced(true).await;
    let vmi = vmi_uuid(VM_UUID, PG_KEY);
    assert!(h.controller.instance_ips().is_empty());

    h.dispatch(guest_net_batch(&handle, vec![guest_nic(MAC, "192.168.1.5")]))
        .await
        .unwrap();

    let ip = "192.168.1.5".parse().ok();
    assert_eq!(h.vmi(VM_UUID, PG_KEY).unwrap().ip_address, ip);
    assert_eq!(h.controller.instance_ips().len(), 1);
    assert_eq!(h.controller.instance_ips()[0].address, ip);
    assert_eq!(h.dataplane.port(&vmi).unwrap().ip, ip);
    h.verifier().assert_port(&vmi, Some(vlan(2)), true).unwrap();

    // Same address again: nothing to do.
    h.clear_calls();
    h.dispatch(guest_net_batch(&handle, vec![guest_nic(MAC, "192.168.1.5")]))
        .await
        .unwrap();
    assert!(h.controller.calls().is_empty());
    assert!(h.dataplane.calls().is_empty());
}

#[tokio::test]
async fn test_guest_ip_zero_mac_skipped() {
    let (mut h, handle) = synced(true).await;

    h.dispatch(guest_net_batch(
        &handle,
        vec![guest_nic("00:00:00:00:00:00", "192.168.1.9")],
    ))
    .await
    .unwrap();

    assert!(h.controller.calls().is_empty());
}

#[tokio::test]
async fn test_nic_detach_deletes_interface() {
    let (mut h, handle) = synced(false).await;
    let port = PortRef::new(PG_KEY, "10");
    h.hv.update_vm(&handle, |props| props.devices.clear());

    h.dispatch(events_batch(vec![event(
        EventKind::Reconfigured,
        &handle,
        "vm-1",
    )]))
    .await
    .unwrap();

    let vmi = vmi_uuid(VM_UUID, PG_KEY);
    h.verifier().assert_no_interface(&vmi).unwrap();
    h.verifier().assert_no_port(&vmi).unwrap();
    assert_eq!(h.hv.set_vlan_calls(), vec![(port, None)]);
    assert!(h.reconciler.state.vlan_pool.is_available(vlan(2)));
    // The VM itself stays.
    assert!(h.controller.vm(&VM_UUID).is_some());
}

#[tokio::test]
async fn test_nic_move_to_other_network() {
    let (mut h, handle) = synced(false).await;
    h.add_network("dvportgroup-2", "DPG2", false);
    h.hv.update_vm(&handle, |props| {
        *props = VmBuilder::new("vm-1", VM_UUID)
            .nic(MAC, "dvportgroup-2", "20")
            .build();
    });

    h.dispatch(events_batch(vec![event(
        EventKind::Reconfigured,
        &handle,
        "vm-1",
    )]))
    .await
    .unwrap();

    assert!(h.vmi(VM_UUID, PG_KEY).is_none());
    let moved = h.vmi(VM_UUID, "dvportgroup-2").expect("interface on new network");
    assert_eq!(moved.display_name, "vmi-DPG2-vm-1");
    assert_eq!(h.controller.interfaces().len(), 1);
    assert_eq!(h.dataplane.ports().len(), 1);
}

#[tokio::test]
async fn test_two_nics_on_one_network_settle_on_lowest_mac() {
    let mut h = Harness::new();
    h.add_network(PG_KEY, PG_NAME, false);
    h.hv.reserve_on_host(vcm_common::VlanReservation::Single(vlan(0)));
    h.hv.reserve_on_host(vcm_common::VlanReservation::Single(vlan(1)));
    let handle = VmHandle::new("vm-1");
    h.hv.add_vm(
        &handle,
        VmBuilder::new("vm-1", VM_UUID)
            .nic("aa:bb:cc:dd:ee:02", PG_KEY, "11")
            .nic("aa:bb:cc:dd:ee:01", PG_KEY, "10")
            .build(),
    );
    h.full_sync().await;

    let uuid = vmi_uuid(VM_UUID, PG_KEY);
    let first = PortRef::new(PG_KEY, "10");
    let second = PortRef::new(PG_KEY, "11");
    let vmi = h.vmi(VM_UUID, PG_KEY).unwrap();
    assert_eq!(vmi.mac, mac("aa:bb:cc:dd:ee:01"));
    assert_eq!(vmi.port, first);
    h.clear_calls();

    for _ in 0..3 {
        h.dispatch(events_batch(vec![event(
            EventKind::Reconfigured,
            &handle,
            "vm-1",
        )]))
        .await
        .unwrap();
    }
    assert_eq!(h.vmi(VM_UUID, PG_KEY).unwrap().port, first);
    assert_eq!(h.controller.count(ControllerOp::UpdateInterface), 0);
    assert!(h.dataplane.calls().is_empty());
    assert!(h.hv.set_vlan_calls().is_empty());

    // Dropping the chosen NIC moves the interface to the other one.
    h.hv.update_vm(&handle, |props| {
        props.devices.retain(|device| device.mac != mac("aa:bb:cc:dd:ee:01"))
    });
    h.dispatch(events_batch(vec![event(
        EventKind::Reconfigured,
        &handle,
        "vm-1",
    )]))
    .await
    .unwrap();

    let vmi = h.vmi(VM_UUID, PG_KEY).unwrap();
    assert_eq!(vmi.mac, mac("aa:bb:cc:dd:ee:02"));
    assert_eq!(vmi.port, second);
    assert_eq!(vmi.vlan_id, Some(vlan(2)));
    assert_eq!(
        h.hv.set_vlan_calls(),
        vec![(first.clone(), None), (second.clone(), Some(vlan(2)))]
    );
    h.verifier().assert_vlan(&first, None).unwrap();
    h.verifier().assert_vlan(&second, Some(vlan(2))).unwrap();
    assert_eq!(h.controller.count(ControllerOp::DeleteInterface), 0);
    assert_eq!(h.controller.interface(&uuid).unwrap().mac, mac("aa:bb:cc:dd:ee:02"));
    assert_eq!(h.dataplane.port(&uuid).unwrap().port_key, "11");
    h.verifier().assert_port(&uuid, Some(vlan(2)), true).unwrap();
}

#[tokio::test]
async fn test_stale_vm_does_not_spoil_batch() {
    let mut h = Harness::new();
    h.add_network(PG_KEY, PG_NAME, false);
    h.full_sync().await;

    let gone = h.add_vm("vm-gone", Uuid::from_u128(0x6001), "aa:bb:cc:dd:ee:01", PG_KEY, "10");
    h.hv.mark_stale(&gone);
    let live = h.add_vm("vm-live", Uuid::from_u128(0x6002), "aa:bb:cc:dd:ee:02", PG_KEY, "11");

    h.dispatch(events_batch(vec![
        event(EventKind::Created, &gone, "vm-gone"),
        event(EventKind::Created, &live, "vm-live"),
    ]))
    .await
    .unwrap();

    assert!(h.reconciler.state.db.get_vm(&Uuid::from_u128(0x6001)).is_none());
    assert!(h.reconciler.state.db.get_vm(&Uuid::from_u128(0x6002)).is_some());
    assert_eq!(h.dataplane.ports().len(), 1);
}

#[tokio::test]
async fn test_lost_controller_aborts_batch_and_keeps_queue() {
    let (mut h, handle) = synced(false).await;
    h.controller.set_unreachable(true);
    h.hv.update_vm(&handle, |props| props.devices.clear());

    let err = h
        .dispatch(events_batch(vec![event(
            EventKind::Reconfigured,
            &handle,
            "vm-1",
        )]))
        .await
        .unwrap_err();

    assert!(err.is_connection_lost());
    let key = vmi_uuid(VM_UUID, PG_KEY);
    assert!(h
        .reconciler
        .state
        .db
        .interfaces_pending_delete
        .contains(&key));
}

#[tokio::test]
async fn test_unknown_property_is_ignored() {
    let (mut h, handle) = synced(false).await;

    h.dispatch(single_change(
        handle,
        "config.annotation",
        PropertyValue::Text("hello".to_string()),
    ))
    .await
    .unwrap();

    assert!(h.controller.calls().is_empty());
    assert_eq!(h.reconciler.settings().local_host, LOCAL_HOST);
}
