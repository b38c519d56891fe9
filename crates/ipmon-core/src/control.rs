//! Control channel
//!
//! A Unix datagram socket at a well-known path. Each datagram carries one
//! command token, `update` or `reload`, with no payload. Commands are turned
//! into [`ControlRequest`]s for the refresh worker, so out-of-band refreshes
//! run through the same single pipeline as debounced ones.
//!
//! `reload` is acknowledged with an empty datagram once the refresh has
//! completed; `update` gets no reply.

use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixDatagram;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Largest datagram read from the socket
const RECV_BUFFER_SIZE: usize = 256;

/// Command accepted on the control socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    /// Refresh using the configured apply path
    Update,
    /// Refresh with a full ruleset reload, then acknowledge
    Reload,
}

impl ControlCommand {
    pub const fn as_str(self) -> &'static str {
        match self {
            ControlCommand::Update => "update",
            ControlCommand::Reload => "reload",
        }
    }

    /// Decode a datagram payload; tokens must match exactly
    pub fn from_bytes(payload: &[u8]) -> Option<Self> {
        match payload {
            b"update" => Some(ControlCommand::Update),
            b"reload" => Some(ControlCommand::Reload),
            _ => None,
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ControlCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_bytes(s.as_bytes())
            .ok_or_else(|| Error::control(format!("Unknown command '{}'", s)))
    }
}

/// A command handed to the refresh worker
#[derive(Debug)]
pub struct ControlRequest {
    pub command: ControlCommand,
    /// Completed by the worker after the refresh finished
    pub ack: Option<oneshot::Sender<()>>,
}

impl ControlRequest {
    /// Request without acknowledgement
    pub fn new(command: ControlCommand) -> Self {
        Self { command, ack: None }
    }

    /// Request plus the receiver that resolves once it has been handled
    pub fn with_ack(command: ControlCommand) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                ack: Some(tx),
            },
            rx,
        )
    }

    /// Signal completion to whoever is waiting
    pub fn complete(self) {
        if let Some(ack) = self.ack {
            let _ = ack.send(());
        }
    }
}

/// Server side of the control channel
pub struct ControlServer {
    socket: UnixDatagram,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the socket, replacing any stale endpoint left at `path`
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale control socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::control(format!(
                    "Cannot remove stale socket {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        let socket = UnixDatagram::bind(&path).map_err(|e| {
            Error::control(format!("Cannot bind {}: {}", path.display(), e))
        })?;

        info!("Control socket listening on {}", path.display());
        Ok(Self { socket, path })
    }

    /// Bind, retrying with a fixed backoff until it succeeds
    pub async fn bind_retrying(path: impl AsRef<Path>, backoff: Duration) -> Self {
        loop {
            match Self::bind(path.as_ref()) {
                Ok(server) => return server,
                Err(e) => {
                    warn!("{}; retrying in {:?}", e, backoff);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receive commands and forward them to the worker
    ///
    /// Runs until the worker side of `requests` is closed. Commands are
    /// handled one at a time; a `reload` is acknowledged before the next
    /// datagram is read.
    pub async fn serve(&self, requests: mpsc::Sender<ControlRequest>) -> Result<()> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Control socket receive failed: {}", e);
                    continue;
                }
            };

            let Some(command) = ControlCommand::from_bytes(&buf[..len]) else {
                warn!(
                    "Ignoring unknown control command {:?}",
                    String::from_utf8_lossy(&buf[..len])
                );
                continue;
            };
            debug!(command = %command, "Control command received");

            match command {
                ControlCommand::Update => {
                    if requests.send(ControlRequest::new(command)).await.is_err() {
                        break;
                    }
                }
                ControlCommand::Reload => {
                    let (request, done) = ControlRequest::with_ack(command);
                    if requests.send(request).await.is_err() {
                        break;
                    }
                    if done.await.is_err() {
                        warn!("Reload was dropped before completion, not acknowledging");
                        continue;
                    }

                    match peer.as_pathname() {
                        Some(reply_to) => {
                            if let Err(e) = self.socket.send_to(&[], reply_to).await {
                                warn!(
                                    "Control reply to {} failed: {}",
                                    reply_to.display(),
                                    e
                                );
                            }
                        }
                        None => debug!("Reload sender is unnamed, no reply sent"),
                    }
                }
            }
        }

        debug!("Refresh worker gone, control channel stopping");
        Ok(())
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Client side of the control channel
pub struct ControlClient {
    server: PathBuf,
}

impl ControlClient {
    pub fn new(server: impl Into<PathBuf>) -> Self {
        Self {
            server: server.into(),
        }
    }

    /// Send `update` from an unnamed socket; there is no reply
    pub async fn update(&self) -> Result<()> {
        let socket = UnixDatagram::unbound()?;
        self.send(&socket, ControlCommand::Update).await
    }

    /// Send `reload` and wait for the empty acknowledgement
    ///
    /// The reply needs a return address, so the client binds its own
    /// endpoint at `reply_path`, distinct from the server's, and removes it
    /// afterwards.
    pub async fn reload(&self, reply_path: &Path, timeout: Duration) -> Result<()> {
        let _ = std::fs::remove_file(reply_path);
        let socket = UnixDatagram::bind(reply_path)?;
        let result = self.reload_on(&socket, timeout).await;
        let _ = std::fs::remove_file(reply_path);
        result
    }

    async fn reload_on(&self, socket: &UnixDatagram, timeout: Duration) -> Result<()> {
        self.send(socket, ControlCommand::Reload).await?;

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::timeout("waiting for reload acknowledgement", timeout)),
        }
    }

    async fn send(&self, socket: &UnixDatagram, command: ControlCommand) -> Result<()> {
        socket
            .send_to(command.as_str().as_bytes(), &self.server)
            .await
            .map_err(|e| {
                Error::control(format!(
                    "Cannot send '{}' to {}: {}",
                    command,
                    self.server.display(),
                    e
                ))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn tokens_match_exactly() {
        assert_eq!(ControlCommand::from_bytes(b"update"), Some(ControlCommand::Update));
        assert_eq!(ControlCommand::from_bytes(b"reload"), Some(ControlCommand::Reload));
        assert_eq!(ControlCommand::from_bytes(b"update\n"), None);
        assert_eq!(ControlCommand::from_bytes(b"RELOAD"), None);
        assert_eq!(ControlCommand::from_bytes(b""), None);
        assert!("flush".parse::<ControlCommand>().is_err());
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipmon.sock");
        std::fs::write(&path, b"stale").unwrap();

        let server = ControlServer::bind(&path).unwrap();
        assert_eq!(server.path(), path);

        drop(server);
        assert!(!path.exists(), "endpoint removed on drop");
    }

    #[tokio::test]
    async fn bind_retrying_waits_for_the_directory() {
        let dir = tempdir().unwrap();
        let run = dir.path().join("run");
        let path = run.join("ipmon.sock");

        let pending = tokio::spawn({
            let path = path.clone();
            async move { ControlServer::bind_retrying(&path, Duration::from_millis(20)).await }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!pending.is_finished());

        std::fs::create_dir(&run).unwrap();
        let server = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.path(), path);
    }

    #[tokio::test]
    async fn update_is_forwarded_without_ack() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipmon.sock");
        let server = ControlServer::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        tokio::spawn(async move { server.serve(tx).await });

        ControlClient::new(&path).update().await.unwrap();

        let request = rx.recv().await.unwrap();
        assert_eq!(request.command, ControlCommand::Update);
        assert!(request.ack.is_none());
    }

    #[tokio::test]
    async fn reload_is_acknowledged_after_completion() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipmon.sock");
        let reply = dir.path().join("client.sock");
        let server = ControlServer::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        tokio::spawn(async move { server.serve(tx).await });
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                assert_eq!(request.command, ControlCommand::Reload);
                request.complete();
            }
        });

        ControlClient::new(&path)
            .reload(&reply, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!reply.exists(), "client endpoint cleaned up");
    }

    #[tokio::test]
    async fn reload_times_out_without_worker_ack() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipmon.sock");
        let server = ControlServer::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::channel::<ControlRequest>(4);

        tokio::spawn(async move { server.serve(tx).await });
        // hold requests without completing them
        let held = tokio::spawn(async move {
            let mut kept = Vec::new();
            while let Some(request) = rx.recv().await {
                kept.push(request);
            }
        });

        let result = ControlClient::new(&path)
            .reload(&dir.path().join("client.sock"), Duration::from_millis(100))
            .await;
        match result {
            Err(Error::Timeout { after, .. }) => assert_eq!(after, Duration::from_millis(100)),
            other => panic!("expected timeout, got {other:?}"),
        }
        held.abort();
    }

    #[tokio::test]
    async fn serve_stops_when_worker_is_gone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipmon.sock");
        let server = ControlServer::bind(&path).unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let handle = tokio::spawn(async move { server.serve(tx).await });
        ControlClient::new(&path).update().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
