// # Netlink Address Monitor
//
// This crate provides the kernel address-change notification source for
// Linux systems.
//
// ## Implementation
//
// 1. `netlink-sys` socket on `NETLINK_ROUTE`, subscribed to
//    RTMGRP_IPV4_IFADDR and RTMGRP_IPV6_IFADDR
// 2. Readiness through tokio `AsyncFd`, so the receive never blocks the runtime
// 3. Datagrams decoded with `netlink-packet-route` in [`decode`]
// 4. Socket setup failures retried with a fixed backoff, forever
// 5. `ENOBUFS` (lost notifications) reported as `MonitorEvent::Overrun`
//
// ## Platform Support
//
// Netlink is Linux-only. On other platforms the monitor yields an empty
// stream so the daemon still runs on control-channel commands.

pub mod decode;

pub use decode::{DecodeError, InterfaceResolver};

#[cfg(target_os = "linux")]
pub use decode::SystemResolver;

use ipmon_core::traits::{AddressEventSource, MonitorEvent};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::Stream;

/// Pause between attempts to (re)create the socket
pub const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Capacity of the channel between the socket task and the worker
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Address-change notification source backed by rtnetlink
pub struct NetlinkMonitor {
    resolver: Arc<dyn InterfaceResolver>,
    retry_backoff: Duration,
}

impl NetlinkMonitor {
    /// Monitor resolving interface names through the system
    #[cfg(target_os = "linux")]
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver))
    }

    pub fn with_resolver(resolver: Arc<dyn InterfaceResolver>) -> Self {
        Self {
            resolver,
            retry_backoff: RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[cfg(target_os = "linux")]
impl Default for NetlinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressEventSource for NetlinkMonitor {
    #[cfg(target_os = "linux")]
    fn watch(&self) -> Pin<Box<dyn Stream<Item = MonitorEvent> + Send + 'static>> {
        let (tx, rx) = tokio::sync::mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(linux::monitor_loop(
            Arc::clone(&self.resolver),
            self.retry_backoff,
            tx,
        ));
        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }

    #[cfg(not(target_os = "linux"))]
    fn watch(&self) -> Pin<Box<dyn Stream<Item = MonitorEvent> + Send + 'static>> {
        tracing::error!("Netlink address monitoring is only supported on Linux");
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::decode::{RTMGRP_IPV4_IFADDR, RTMGRP_IPV6_IFADDR, decode_datagram};
    use super::InterfaceResolver;
    use ipmon_core::Error;
    use ipmon_core::traits::MonitorEvent;
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::unix::AsyncFd;
    use tokio::sync::mpsc;
    use tracing::{debug, info, trace, warn};

    /// Receive buffer; large enough for a full rtnetlink datagram
    const RECV_BUFFER_SIZE: usize = 64 * 1024;

    /// What one receive attempt amounts to
    #[derive(Debug)]
    enum Received {
        /// Events to forward, possibly none
        Events(Vec<MonitorEvent>),
        /// The socket is unusable and must be reopened
        Failed(std::io::Error),
    }

    /// Turn the result of `recv_from` into monitor events
    ///
    /// `ENOBUFS` means the kernel dropped notifications and becomes
    /// [`MonitorEvent::Overrun`]. Datagrams not sent by the kernel
    /// (port id 0) are discarded.
    fn handle_recv(
        result: std::io::Result<(usize, SocketAddr)>,
        buf: &[u8],
        resolver: &dyn InterfaceResolver,
    ) -> Received {
        match result {
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                warn!("Netlink receive buffer overrun, notifications lost");
                Received::Events(vec![MonitorEvent::Overrun])
            }
            Err(e) => Received::Failed(e),
            Ok((_, sender)) if sender.port_number() != 0 => {
                warn!(
                    port = sender.port_number(),
                    "Discarding netlink datagram from non-kernel sender"
                );
                Received::Events(Vec::new())
            }
            Ok((len, _)) => {
                let len = len.min(buf.len());
                let events = decode_datagram(&buf[..len], resolver);
                trace!(bytes = len, events = events.len(), "Netlink datagram decoded");
                Received::Events(events.into_iter().map(MonitorEvent::Address).collect())
            }
        }
    }

    fn open_socket() -> std::io::Result<AsyncFd<Socket>> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind(&SocketAddr::new(0, RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR))?;
        socket.set_non_blocking(true)?;
        AsyncFd::new(socket)
    }

    /// Open the socket, retrying until it works or nobody listens anymore
    async fn open_with_retry(
        backoff: Duration,
        tx: &mpsc::Sender<MonitorEvent>,
    ) -> Option<AsyncFd<Socket>> {
        loop {
            if tx.is_closed() {
                return None;
            }
            match open_socket() {
                Ok(socket) => {
                    info!("Listening for interface address changes");
                    return Some(socket);
                }
                Err(e) => {
                    warn!(
                        "{}; retrying in {:?}",
                        Error::netlink(format!("socket setup failed: {}", e)),
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    pub(super) async fn monitor_loop(
        resolver: Arc<dyn InterfaceResolver>,
        backoff: Duration,
        tx: mpsc::Sender<MonitorEvent>,
    ) {
        let mut buf: Vec<u8> = Vec::with_capacity(RECV_BUFFER_SIZE);

        'reopen: loop {
            let Some(socket) = open_with_retry(backoff, &tx).await else {
                debug!("Event consumer gone, netlink monitor stopping");
                return;
            };

            loop {
                let mut guard = match socket.readable().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!("Netlink readiness failed: {}; reopening", e);
                        tokio::time::sleep(backoff).await;
                        continue 'reopen;
                    }
                };

                buf.clear();
                let received = guard.try_io(|inner| inner.get_ref().recv_from(&mut buf, 0));

                let Ok(result) = received else {
                    continue;
                };

                match handle_recv(result, &buf, resolver.as_ref()) {
                    Received::Events(events) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Received::Failed(e) => {
                        warn!("Netlink receive failed: {}; reopening", e);
                        tokio::time::sleep(backoff).await;
                        continue 'reopen;
                    }
                }
            }
        }
    }

}
