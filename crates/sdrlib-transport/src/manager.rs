//! Channel lifecycle management.
//!
//! A [`ChannelManager`] owns at most one connection of one kind to a driven
//! process's socket. It makes `connect` idempotent, turns connect failures
//! and peer closes into a delayed reconnect, and makes `disconnect` safe to
//! call any number of times. The reconnect timer is a deadline owned by the
//! manager; disconnecting or shutting down clears it, so a stale timer can
//! never reconnect a channel that has been torn down.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use sdrlib_core::error::{Error, Result};
use sdrlib_core::transport::{Channel, ChannelKind};

use crate::unix::{DEFAULT_CONNECT_TIMEOUT, UnixChannel};

/// How long a single `receive` waits before looping.
const IDLE_POLL: Duration = Duration::from_secs(30);

/// Result of a successful [`ChannelManager::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new connection was opened.
    Connected,
    /// A connection already existed; nothing was done.
    AlreadyConnected,
}

/// Owner of one command or data channel.
pub struct ChannelManager {
    path: PathBuf,
    kind: ChannelKind,
    channel: Option<Box<dyn Channel>>,
    reconnect_delay: Duration,
    connect_timeout: Duration,
    reconnect_at: Option<Instant>,
    quitting: bool,
}

impl ChannelManager {
    pub fn new(path: impl Into<PathBuf>, kind: ChannelKind, reconnect_delay: Duration) -> Self {
        ChannelManager {
            path: path.into(),
            kind,
            channel: None,
            reconnect_delay,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_at: None,
            quitting: false,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_connected(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_connected())
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    /// Open the connection unless one already exists.
    ///
    /// On failure a reconnect is scheduled and the error returned.
    pub async fn connect(&mut self) -> Result<ConnectOutcome> {
        if self.quitting {
            return Err(Error::Terminated);
        }
        if self.is_connected() {
            debug!(path = %self.path.display(), kind = %self.kind, "already connected");
            return Ok(ConnectOutcome::AlreadyConnected);
        }
        self.reconnect_at = None;
        match UnixChannel::connect_with_timeout(&self.path, self.kind, self.connect_timeout).await {
            Ok(channel) => {
                self.channel = Some(Box::new(channel));
                Ok(ConnectOutcome::Connected)
            }
            Err(e) => {
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    /// Install an already-open channel.
    pub fn attach(&mut self, channel: Box<dyn Channel>) -> ConnectOutcome {
        if self.is_connected() {
            debug!(path = %self.path.display(), kind = %self.kind, "already connected");
            return ConnectOutcome::AlreadyConnected;
        }
        self.reconnect_at = None;
        self.channel = Some(channel);
        ConnectOutcome::Connected
    }

    /// Write to the channel. A write failure counts as losing the channel.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let channel = self.channel.as_mut().ok_or(Error::NotConnected)?;
        match channel.send(data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(path = %self.path.display(), kind = %self.kind, error = %e, "send failed");
                self.lost().await;
                Err(e)
            }
        }
    }

    /// Wait for inbound bytes. Pending while disconnected. Cancellation-safe.
    ///
    /// Returns [`Error::ConnectionLost`] once when the channel goes away; by
    /// then it has been dropped and a reconnect scheduled.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let Some(channel) = self.channel.as_mut() else {
                return std::future::pending().await;
            };
            match channel.receive(buf, IDLE_POLL).await {
                Err(Error::Timeout) => continue,
                Ok(n) => return Ok(n),
                Err(e) => {
                    info!(path = %self.path.display(), kind = %self.kind, error = %e, "channel lost");
                    self.lost().await;
                    return Err(Error::ConnectionLost);
                }
            }
        }
    }

    async fn lost(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.close().await;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.quitting {
            return;
        }
        debug!(
            path = %self.path.display(),
            kind = %self.kind,
            delay_ms = self.reconnect_delay.as_millis(),
            "reconnect scheduled"
        );
        self.reconnect_at = Some(Instant::now() + self.reconnect_delay);
    }

    /// When the next reconnect attempt is due, if one is armed.
    ///
    /// The owner sleeps until this deadline and then calls
    /// [`connect`](Self::connect), which clears it.
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Close the channel and cancel any reconnect. Safe to repeat.
    pub async fn disconnect(&mut self) {
        self.reconnect_at = None;
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.close().await;
            debug!(path = %self.path.display(), kind = %self.kind, "disconnected");
        }
    }

    /// Disconnect for good; later `connect` calls fail.
    pub async fn shutdown(&mut self) {
        self.quitting = true;
        self.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdrlib_test_harness::MockChannel;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    const DELAY: Duration = Duration::from_millis(5001);

    #[tokio::test]
    async fn connect_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("airspy-1:4.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });

        let mut mgr = ChannelManager::new(&path, ChannelKind::Command, DELAY);
        assert_eq!(mgr.connect().await.unwrap(), ConnectOutcome::Connected);
        assert_eq!(mgr.connect().await.unwrap(), ConnectOutcome::AlreadyConnected);
        assert!(mgr.is_connected());
        let _peer = accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_connect_schedules_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = ChannelManager::new(dir.path().join("gone.sock"), ChannelKind::Data, DELAY);
        assert!(mgr.connect().await.is_err());
        assert!(mgr.reconnect_pending());
        mgr.disconnect().await;
        assert!(!mgr.reconnect_pending());
    }

    #[tokio::test]
    async fn peer_close_reported_once_and_reconnect_armed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grh.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"hi\n").await.unwrap();
        });

        let mut mgr = ChannelManager::new(&path, ChannelKind::Command, DELAY);
        mgr.connect().await.unwrap();
        server.await.unwrap();

        let mut buf = [0u8; 16];
        let n = mgr.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi\n");
        assert!(matches!(mgr.recv(&mut buf).await, Err(Error::ConnectionLost)));
        assert!(!mgr.is_connected());
        assert!(mgr.reconnect_pending());
    }

    #[tokio::test]
    async fn disconnect_twice_is_safe() {
        let (a, _b) = tokio::net::UnixStream::pair().unwrap();
        let mut mgr = ChannelManager::new("pair", ChannelKind::Command, DELAY);
        mgr.attach(Box::new(UnixChannel::from_stream(a, "pair", ChannelKind::Command)));
        mgr.disconnect().await;
        mgr.disconnect().await;
        assert!(!mgr.is_connected());
        assert!(matches!(mgr.send(b"x").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn attached_channel_carries_replies() {
        let mut mock = MockChannel::new(ChannelKind::Command);
        mock.expect(&[0x01, 0x09, 0xEA, 0xB2, 0x40], b"{\"frequency\":166376000}\n");
        let mut mgr = ChannelManager::new("mock", ChannelKind::Command, DELAY);
        assert_eq!(mgr.attach(Box::new(mock)), ConnectOutcome::Connected);

        mgr.send(&[0x01, 0x09, 0xEA, 0xB2, 0x40]).await.unwrap();
        let mut buf = [0u8; 64];
        let n = mgr.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"frequency\":166376000}\n");
    }

    #[tokio::test]
    async fn failed_send_drops_the_channel() {
        let mut mock = MockChannel::new(ChannelKind::Command);
        mock.hang_up();
        let mut mgr = ChannelManager::new("mock", ChannelKind::Command, DELAY);
        mgr.attach(Box::new(mock));

        assert!(matches!(mgr.send(b"list\n").await, Err(Error::ConnectionLost)));
        assert!(!mgr.is_connected());
        assert!(mgr.reconnect_pending());
    }

    #[tokio::test]
    async fn shutdown_blocks_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = ChannelManager::new(dir.path().join("x.sock"), ChannelKind::Command, DELAY);
        mgr.shutdown().await;
        assert!(matches!(mgr.connect().await, Err(Error::Terminated)));
        assert!(!mgr.reconnect_pending());
    }
}
