//! Refresh worker
//!
//! The IpmonEngine is the only task that touches the debounce state and
//! runs the refresh pipeline. It is responsible for:
//! - Feeding address notifications into the DebounceScheduler
//! - Running a refresh when the scheduler fires or a control request arrives
//! - Publishing the new snapshot and pushing it into the firewall
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐                  ┌────────────────┐
//! │ AddressEventSource │── MonitorEvent ─▶│                │
//! └────────────────────┘                  │   IpmonEngine  │
//! ┌────────────────────┐                  │   (debounce)   │
//! │   ControlServer    │─ ControlRequest ▶│                │
//! └────────────────────┘                  └────────────────┘
//!                                                  │ refresh
//!        ┌──────────────────┬──────────────────────┼───────────────────┐
//!        ▼                  ▼                      ▼                   ▼
//! ┌─────────────┐  ┌─────────────────┐  ┌────────────────────┐  ┌────────────┐
//! │  Collector  │  │ PersistentConfig│  │  RuntimeApplier or │  │   Events   │
//! │ (snapshot)  │  │ Writer (files)  │  │  full file reload  │  │  (notify)  │
//! └─────────────┘  └─────────────────┘  └────────────────────┘  └────────────┘
//! ```
//!
//! ## Refresh Flow
//!
//! 1. Rescan every interface and replace the stored snapshot
//! 2. Rewrite the persisted files, if nftables output is configured
//! 3. Full reload (`flush`, startup, `reload`) or probe-gated runtime update
//! 4. Print interface status in monitor mode
//!
//! A refresh always runs to completion; nothing else is handled meanwhile.

use crate::apply::{ApplyOutcome, RuntimeApplier};
use crate::collector::SnapshotCollector;
use crate::context::AppContext;
use crate::control::{ControlCommand, ControlRequest};
use crate::debounce::DebounceScheduler;
use crate::error::{Error, Result};
use crate::snapshot::SnapshotStore;
use crate::traits::{AddressEventSource, MonitorEvent};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// What started a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// The debounce window after a notification burst elapsed
    Debounced,
    /// `update` on the control channel
    Update,
    /// `reload` on the control channel
    Reload,
    /// `start` flag, before any event
    Startup,
}

impl RefreshTrigger {
    /// Whether this trigger always takes the full reload path
    pub fn forces_full_reload(self) -> bool {
        matches!(self, RefreshTrigger::Reload | RefreshTrigger::Startup)
    }
}

impl From<ControlCommand> for RefreshTrigger {
    fn from(command: ControlCommand) -> Self {
        match command {
            ControlCommand::Update => RefreshTrigger::Update,
            ControlCommand::Reload => RefreshTrigger::Reload,
        }
    }
}

/// How the firewall was brought up to date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPath {
    /// No firewall engine attached; only the snapshot (and files) changed
    SnapshotOnly,
    /// Probe-gated runtime batch
    Runtime { commands: usize },
    /// The top-level ruleset file was reloaded
    FullReload,
}

/// Events emitted by the IpmonEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Worker started
    Started { delay: Duration },

    /// A refresh ran through the whole pipeline
    RefreshCompleted {
        trigger: RefreshTrigger,
        interfaces: usize,
        path: ApplyPath,
    },

    /// A dry-run probe failed; live state untouched
    ApplyAborted {
        trigger: RefreshTrigger,
        failed_probes: Vec<String>,
    },

    /// The refresh failed part way
    RefreshFailed {
        trigger: RefreshTrigger,
        error: String,
    },

    /// Worker stopped
    Stopped { reason: String },
}

type ShutdownSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Refresh worker
///
/// ## Lifecycle
///
/// 1. Create with [`IpmonEngine::new()`]
/// 2. Start with [`IpmonEngine::run()`]
/// 3. Runs until SIGINT/SIGTERM
///
/// ## Load Resistance
///
/// - **Debounce**: a burst of notifications yields one refresh per window
/// - **Retry**: a refresh that failed on a transient error (timeout, I/O)
///   is re-run after `retry_backoff`
/// - **Bounded event channel**: observers that fall behind lose events
///   (logged) instead of growing memory
pub struct IpmonEngine {
    context: AppContext,
    events: Box<dyn AddressEventSource>,
    requests: mpsc::Receiver<ControlRequest>,
    event_tx: mpsc::Sender<EngineEvent>,
}

impl IpmonEngine {
    /// Create a new engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    pub fn new(
        context: AppContext,
        events: Box<dyn AddressEventSource>,
        requests: mpsc::Receiver<ControlRequest>,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        context.config.validate()?;

        let (tx, rx) = mpsc::channel(context.config.event_channel_capacity);

        let engine = Self {
            context,
            events,
            requests,
            event_tx: tx,
        };

        Ok((engine, rx))
    }

    /// Handle to the snapshot published by this engine
    pub fn snapshots(&self) -> SnapshotStore {
        self.context.snapshots.clone()
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        self.run_internal(Box::pin(os_shutdown_signal())).await
    }

    /// Run until `shutdown_rx` resolves, or OS signals if `None`
    ///
    /// **TESTING ONLY**: contract tests need a controlled shutdown. The daemon
    /// uses [`run()`](Self::run).
    pub async fn run_with_shutdown(self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        match shutdown_rx {
            Some(rx) => {
                self.run_internal(Box::pin(async move {
                    let _ = rx.await;
                }))
                .await
            }
            None => self.run().await,
        }
    }

    async fn run_internal(mut self, mut shutdown: ShutdownSignal) -> Result<()> {
        let mut scheduler = DebounceScheduler::new(self.context.config.delay());
        self.emit_event(EngineEvent::Started {
            delay: scheduler.delay(),
        });
        info!("Refresh worker started, delay {:?}", scheduler.delay());

        let backoff = self.context.config.retry_backoff();
        let mut retry: Option<(Instant, RefreshTrigger)> = None;

        if self.context.config.start {
            retry = self.refresh_with_retry(RefreshTrigger::Startup, backoff).await;
        }

        let mut stream = self.events.watch();
        let mut stream_open = true;
        let mut requests_open = true;

        let reason = loop {
            let deadline = scheduler.deadline();
            let retry_at = retry.map(|(at, _)| at);

            tokio::select! {
                event = stream.next(), if stream_open => match event {
                    Some(event) => self.on_monitor_event(&mut scheduler, event),
                    None => {
                        warn!("Address event stream ended");
                        stream_open = false;
                    }
                },

                request = self.requests.recv(), if requests_open => match request {
                    Some(request) => {
                        debug!(command = %request.command, "Handling control request");
                        retry = self.refresh_with_retry(request.command.into(), backoff).await;
                        request.complete();
                    }
                    None => {
                        debug!("Control channel closed");
                        requests_open = false;
                    }
                },

                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    if scheduler.poll(Instant::now()) {
                        retry = self.refresh_with_retry(RefreshTrigger::Debounced, backoff).await;
                    }
                }

                _ = sleep_until_deadline(retry_at), if retry_at.is_some() => {
                    if let Some((_, trigger)) = retry.take() {
                        debug!(?trigger, "Retrying refresh");
                        retry = self.refresh_with_retry(trigger, backoff).await;
                    }
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break "Shutdown signal".to_string();
                }
            }
        };

        self.emit_event(EngineEvent::Stopped { reason });
        info!("Refresh worker stopped");
        Ok(())
    }

    fn on_monitor_event(&self, scheduler: &mut DebounceScheduler, event: MonitorEvent) {
        match event {
            MonitorEvent::Address(event) => {
                if self.context.config.monitor {
                    info!("{}", event);
                } else {
                    debug!("{}", event);
                }
            }
            MonitorEvent::Overrun => {
                warn!("Address notifications were lost, scheduling a full rescan");
            }
        }

        if scheduler.on_event(Instant::now()) {
            debug!("Refresh scheduled in {:?}", scheduler.delay());
        }
    }

    /// Refresh, returning when and what to retry if it failed transiently
    ///
    /// Any later refresh replaces a pending retry, since it rebuilds the
    /// same state from a fresh rescan.
    async fn refresh_with_retry(
        &self,
        trigger: RefreshTrigger,
        backoff: Duration,
    ) -> Option<(Instant, RefreshTrigger)> {
        match self.refresh(trigger).await {
            Some(e) if e.is_transient() => {
                warn!("Transient refresh failure, retrying in {:?}: {}", backoff, e);
                Some((Instant::now() + backoff, trigger))
            }
            _ => None,
        }
    }

    /// Run the refresh pipeline once; failures are logged and reported as events
    async fn refresh(&self, trigger: RefreshTrigger) -> Option<Error> {
        match self.refresh_inner(trigger).await {
            Ok(Some((interfaces, path))) => {
                debug!(?trigger, ?path, interfaces, "Refresh completed");
                self.emit_event(EngineEvent::RefreshCompleted {
                    trigger,
                    interfaces,
                    path,
                });
                None
            }
            Ok(None) => None,
            Err(e) => {
                error!("Refresh failed: {}", e);
                self.emit_event(EngineEvent::RefreshFailed {
                    trigger,
                    error: e.to_string(),
                });
                Some(e)
            }
        }
    }

    /// `Ok(None)` means the runtime update was aborted by a probe
    async fn refresh_inner(&self, trigger: RefreshTrigger) -> Result<Option<(usize, ApplyPath)>> {
        let ctx = &self.context;

        let snapshot = SnapshotCollector::new(ctx.interfaces.as_ref()).collect()?;
        ctx.snapshots.replace(snapshot).await;
        let snapshot = ctx.snapshots.current().await;

        if let Some(writer) = &ctx.writer {
            // already logged by the writer; the previous files stay in place
            let _ = writer.write(&snapshot).await;
        }

        let path = match (&ctx.firewall, &ctx.config.nft) {
            (Some(firewall), Some(nft)) if ctx.config.flush || trigger.forces_full_reload() => {
                firewall.load_file(&nft.conf_file).await?;
                info!("Reloaded nftables ruleset from {}", nft.conf_file.display());
                ApplyPath::FullReload
            }
            (Some(firewall), _) => {
                let ruleset = ctx.generator.generate(&snapshot);
                match RuntimeApplier::new(firewall.as_ref()).apply(&ruleset).await? {
                    ApplyOutcome::Applied { commands } => ApplyPath::Runtime { commands },
                    ApplyOutcome::Aborted { failed_probes } => {
                        error!(
                            "Runtime update aborted, live ruleset untouched: {}",
                            Error::Validation(failed_probes.clone())
                        );
                        self.emit_event(EngineEvent::ApplyAborted {
                            trigger,
                            failed_probes,
                        });
                        self.print_status(&snapshot);
                        return Ok(None);
                    }
                }
            }
            (None, _) => ApplyPath::SnapshotOnly,
        };

        self.print_status(&snapshot);
        Ok(Some((snapshot.len(), path)))
    }

    fn print_status(&self, snapshot: &crate::snapshot::InterfaceSnapshot) {
        if self.context.config.monitor {
            for line in snapshot.status_lines() {
                info!("{}", line);
            }
        }
    }

    /// Emit an engine event, dropping it with a warning when the channel is full
    fn emit_event(&self, event: EngineEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Resolves on SIGINT, or SIGTERM on Unix
async fn os_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
