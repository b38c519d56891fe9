//! Contract Test: Idempotent Output
//!
//! Refreshing twice against unchanged interfaces produces the same batch and
//! byte-identical files; a changed interface table shows up in both.

mod common;

use common::*;
use ipmon_core::control::ControlRequest;
use ipmon_core::engine::{EngineEvent, RefreshTrigger};
use ipmon_core::traits::InterfaceEntry;
use ipmon_core::ControlCommand;
use std::net::Ipv4Addr;
use std::time::Duration;
use tempfile::tempdir;

async fn update(harness: &mut Harness) {
    let (request, done) = ControlRequest::with_ack(ControlCommand::Update);
    harness.requests.send(request).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), done)
        .await
        .expect("update handled in time")
        .expect("worker acknowledges");
}

#[tokio::test]
async fn unchanged_state_yields_identical_output() {
    let dir = tempdir().unwrap();
    let firewall = RecordingFirewall::new();
    let mut harness = Harness::spawn(test_config(dir.path()), StaticInterfaces::eth0(), firewall.clone());
    let vars = dir.path().join("ipmon.vars");
    let sets = dir.path().join("ipmon.sets");

    update(&mut harness).await;
    let first_vars = std::fs::read(&vars).unwrap();
    let first_sets = std::fs::read(&sets).unwrap();

    update(&mut harness).await;
    harness.stop().await;

    assert_eq!(std::fs::read(&vars).unwrap(), first_vars);
    assert_eq!(std::fs::read(&sets).unwrap(), first_sets);

    let batches = firewall.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0], batches[1]);
}

#[tokio::test]
async fn changed_state_is_picked_up_by_the_next_refresh() {
    let dir = tempdir().unwrap();
    let interfaces = StaticInterfaces::eth0();
    let firewall = RecordingFirewall::new();
    let mut harness = Harness::spawn(test_config(dir.path()), interfaces.clone(), firewall.clone());

    update(&mut harness).await;

    interfaces.set(vec![InterfaceEntry::v4(
        "eth0",
        Ipv4Addr::new(10, 0, 0, 5),
        Ipv4Addr::new(255, 0, 0, 0),
    )]);
    harness.notify.send(new_addr("eth0", [10, 0, 0, 5])).unwrap();
    harness
        .wait_for(Duration::from_secs(2), |e| {
            matches!(
                e,
                EngineEvent::RefreshCompleted {
                    trigger: RefreshTrigger::Debounced,
                    ..
                }
            )
        })
        .await
        .expect("debounced refresh");
    harness.stop().await;

    let vars = std::fs::read_to_string(dir.path().join("ipmon.vars")).unwrap();
    assert!(vars.contains("redefine eth0_ipv4_address = { 10.0.0.5, }"));
    assert!(vars.contains("redefine eth0_ipv4_network = { 10.0.0.0/8, }"));
    assert!(!vars.contains("lo_"), "vanished interface dropped");

    let last = firewall.batches().pop().unwrap();
    assert_eq!(last["nftables"][2]["add"]["element"]["elem"][0], "10.0.0.5");
}
