//! Test doubles and common utilities for contract tests
//!
//! Minimal doubles that record how the refresh worker uses its
//! collaborators, without touching the kernel or a real firewall.

#![allow(dead_code)]

use async_trait::async_trait;
use ipmon_core::config::{IpmonConfig, NftConfig};
use ipmon_core::control::ControlRequest;
use ipmon_core::engine::EngineEvent;
use ipmon_core::error::{Error, Result};
use ipmon_core::traits::{
    AddressEvent, AddressEventKind, AddressEventSource, FirewallEngine, InterfaceEntry,
    InterfaceSource, MonitorEvent,
};
use ipmon_core::{AppContext, IpmonEngine};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// Debounce delay used by the contract tests
pub const TEST_DELAY: Duration = Duration::from_millis(50);

/// Backoff before a transiently failed refresh is re-run
pub const TEST_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// An event source the test drives by hand
pub struct ControlledEventSource {
    engine_rx: Mutex<Option<mpsc::UnboundedReceiver<MonitorEvent>>>,
}

impl ControlledEventSource {
    pub fn new() -> (Self, mpsc::UnboundedSender<MonitorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                engine_rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

impl AddressEventSource for ControlledEventSource {
    fn watch(&self) -> Pin<Box<dyn Stream<Item = MonitorEvent> + Send + 'static>> {
        let rx = self
            .engine_rx
            .lock()
            .unwrap()
            .take()
            .expect("watch() can only be called once");

        Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }
}

/// A new-address notification for `interface`
pub fn new_addr(interface: &str, address: [u8; 4]) -> MonitorEvent {
    MonitorEvent::Address(AddressEvent::new(
        AddressEventKind::NewAddr,
        2,
        interface,
        IpAddr::from(address),
    ))
}

/// An interface source returning a fixed, swappable table
#[derive(Clone, Default)]
pub struct StaticInterfaces {
    entries: Arc<Mutex<Vec<InterfaceEntry>>>,
    enumerate_count: Arc<AtomicUsize>,
}

impl StaticInterfaces {
    pub fn new(entries: Vec<InterfaceEntry>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries)),
            enumerate_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `lo` without addresses plus `eth0` with 192.168.1.10/24
    pub fn eth0() -> Self {
        Self::new(vec![
            InterfaceEntry::link("lo"),
            InterfaceEntry::link("eth0"),
            InterfaceEntry::v4(
                "eth0",
                Ipv4Addr::new(192, 168, 1, 10),
                Ipv4Addr::new(255, 255, 255, 0),
            ),
        ])
    }

    pub fn set(&self, entries: Vec<InterfaceEntry>) {
        *self.entries.lock().unwrap() = entries;
    }

    /// Number of full rescans performed
    pub fn enumerate_count(&self) -> usize {
        self.enumerate_count.load(Ordering::SeqCst)
    }
}

impl InterfaceSource for StaticInterfaces {
    fn enumerate(&self) -> Result<Vec<InterfaceEntry>> {
        self.enumerate_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.lock().unwrap().clone())
    }
}

/// A firewall engine that records every call
#[derive(Clone, Default)]
pub struct RecordingFirewall {
    checks: Arc<Mutex<Vec<String>>>,
    batches: Arc<Mutex<Vec<serde_json::Value>>>,
    loads: Arc<Mutex<Vec<PathBuf>>>,
    reject_probes: Arc<Mutex<bool>>,
    failures_left: Arc<AtomicUsize>,
    failures_time_out: bool,
}

impl RecordingFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every dry-run probe fail
    pub fn rejecting_probes() -> Self {
        let firewall = Self::default();
        *firewall.reject_probes.lock().unwrap() = true;
        firewall
    }

    /// Make the first `count` batch submissions time out
    pub fn timing_out_applies(count: usize) -> Self {
        let firewall = Self {
            failures_time_out: true,
            ..Self::default()
        };
        firewall.failures_left.store(count, Ordering::SeqCst);
        firewall
    }

    /// Make the first `count` batch submissions fail with an nft error
    pub fn rejecting_applies(count: usize) -> Self {
        let firewall = Self::default();
        firewall.failures_left.store(count, Ordering::SeqCst);
        firewall
    }

    pub fn checks(&self) -> Vec<String> {
        self.checks.lock().unwrap().clone()
    }

    pub fn batches(&self) -> Vec<serde_json::Value> {
        self.batches.lock().unwrap().clone()
    }

    pub fn loads(&self) -> Vec<PathBuf> {
        self.loads.lock().unwrap().clone()
    }
}

#[async_trait]
impl FirewallEngine for RecordingFirewall {
    async fn check(&self, command: &str) -> Result<()> {
        self.checks.lock().unwrap().push(command.to_string());
        if *self.reject_probes.lock().unwrap() {
            return Err(Error::firewall("Error: No such file or directory"));
        }
        Ok(())
    }

    async fn apply(&self, batch: &serde_json::Value) -> Result<()> {
        self.batches.lock().unwrap().push(batch.clone());
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(if self.failures_time_out {
                Error::timeout("nft --json", Duration::from_secs(10))
            } else {
                Error::firewall("Error: Could not process rule")
            });
        }
        Ok(())
    }

    async fn load_file(&self, path: &Path) -> Result<()> {
        self.loads.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn engine_name(&self) -> &'static str {
        "recording"
    }
}

/// Config with the short test delay and nftables output under `dir`
pub fn test_config(dir: &Path) -> IpmonConfig {
    let mut nft = NftConfig::new(dir.join("ipmon"));
    nft.conf_file = dir.join("nftables.conf");
    IpmonConfig::new()
        .with_delay(TEST_DELAY)
        .with_retry_backoff(TEST_RETRY_BACKOFF)
        .with_nft(nft)
}

/// A running engine plus the handles a test needs
pub struct Harness {
    pub notify: mpsc::UnboundedSender<MonitorEvent>,
    pub requests: mpsc::Sender<ControlRequest>,
    pub events: mpsc::Receiver<EngineEvent>,
    pub shutdown: tokio::sync::oneshot::Sender<()>,
    pub handle: tokio::task::JoinHandle<Result<()>>,
}

impl Harness {
    /// Spawn an engine over the given doubles
    pub fn spawn(
        config: IpmonConfig,
        interfaces: StaticInterfaces,
        firewall: RecordingFirewall,
    ) -> Self {
        let (source, notify) = ControlledEventSource::new();
        let (requests, requests_rx) = mpsc::channel(8);
        let context = AppContext::new(config, Box::new(interfaces))
            .expect("valid test config")
            .with_firewall(Box::new(firewall));
        let (engine, events) = IpmonEngine::new(context, Box::new(source), requests_rx)
            .expect("engine construction succeeds");

        let (shutdown, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(engine.run_with_shutdown(Some(shutdown_rx)));

        Self {
            notify,
            requests,
            events,
            shutdown,
            handle,
        }
    }

    /// Wait for the next event matching `pred`, skipping others
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        pred: impl Fn(&EngineEvent) -> bool,
    ) -> Option<EngineEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) if pred(&event) => return Some(event),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }

    /// Count refresh completions arriving within `window`
    pub async fn count_refreshes(&mut self, window: Duration) -> usize {
        let mut count = 0;
        while self
            .wait_for(window, |e| matches!(e, EngineEvent::RefreshCompleted { .. }))
            .await
            .is_some()
        {
            count += 1;
        }
        count
    }

    /// Stop the engine and wait for it
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        self.handle
            .await
            .expect("engine task joins")
            .expect("engine stops cleanly");
    }
}
