//! Contract Test: Fail-Closed Runtime Update
//!
//! A rejected dry-run probe must keep the live ruleset untouched.
//!
//! If this test fails, someone has made the worker:
//! - Submit the batch despite a failed probe
//! - Skip probing before a runtime update
//! - Stop after a failed refresh

mod common;

use common::*;
use ipmon_core::engine::{ApplyPath, EngineEvent};
use std::time::Duration;
use tempfile::tempdir;

#[tokio::test]
async fn rejected_probe_aborts_the_update() {
    let dir = tempdir().unwrap();
    let firewall = RecordingFirewall::rejecting_probes();
    let mut harness = Harness::spawn(test_config(dir.path()), StaticInterfaces::eth0(), firewall.clone());

    harness.notify.send(new_addr("eth0", [192, 168, 1, 10])).unwrap();

    let event = harness
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::ApplyAborted { .. }))
        .await
        .expect("apply aborted");

    match event {
        EngineEvent::ApplyAborted { failed_probes, .. } => assert_eq!(failed_probes.len(), 4),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(firewall.batches().is_empty(), "live state untouched");

    // the worker keeps running
    harness.notify.send(new_addr("eth0", [192, 168, 1, 11])).unwrap();
    let again = harness
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::ApplyAborted { .. }))
        .await;
    harness.stop().await;

    assert!(again.is_some());
}

#[tokio::test]
async fn aborted_update_still_refreshes_persisted_files() {
    let dir = tempdir().unwrap();
    let mut harness = Harness::spawn(
        test_config(dir.path()),
        StaticInterfaces::eth0(),
        RecordingFirewall::rejecting_probes(),
    );

    harness.notify.send(new_addr("eth0", [192, 168, 1, 10])).unwrap();
    harness
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::ApplyAborted { .. }))
        .await
        .expect("apply aborted");
    harness.stop().await;

    let vars = std::fs::read_to_string(dir.path().join("ipmon.vars")).unwrap();
    assert!(vars.contains("redefine eth0_ipv4_address = { 192.168.1.10, }"));
}

#[tokio::test]
async fn flush_mode_reloads_instead_of_probing() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.flush = true;
    let firewall = RecordingFirewall::rejecting_probes();
    let mut harness = Harness::spawn(config, StaticInterfaces::eth0(), firewall.clone());

    harness.notify.send(new_addr("eth0", [192, 168, 1, 10])).unwrap();
    let event = harness
        .wait_for(Duration::from_secs(2), |e| matches!(e, EngineEvent::RefreshCompleted { .. }))
        .await
        .expect("refresh completes");
    harness.stop().await;

    assert!(matches!(
        event,
        EngineEvent::RefreshCompleted {
            path: ApplyPath::FullReload,
            ..
        }
    ));
    assert!(firewall.checks().is_empty());
    assert_eq!(firewall.loads().len(), 1);
}
