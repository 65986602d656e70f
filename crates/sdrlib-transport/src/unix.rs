//! Unix-domain socket channel.
//!
//! Driven processes listen on a filesystem socket path. A [`UnixChannel`]
//! is one client connection to that path; the command and data channels of
//! a session are two separate `UnixChannel`s to the same path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use sdrlib_core::error::{Error, Result};
use sdrlib_core::transport::{Channel, ChannelKind};

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A connection to a driven process's listening socket.
#[derive(Debug)]
pub struct UnixChannel {
    /// `None` after `close()`.
    stream: Option<UnixStream>,
    path: PathBuf,
    kind: ChannelKind,
}

impl UnixChannel {
    /// Connect to `path` using the default timeout.
    pub async fn connect(path: impl AsRef<Path>, kind: ChannelKind) -> Result<Self> {
        Self::connect_with_timeout(path, kind, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connect to `path`, giving up after `timeout`.
    pub async fn connect_with_timeout(
        path: impl AsRef<Path>,
        kind: ChannelKind,
        timeout: Duration,
    ) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), %kind, "connecting");

        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| {
                tracing::warn!(path = %path.display(), %kind, "connect timed out");
                Error::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(path = %path.display(), %kind, error = %e, "connect failed");
                map_connect_error(e, path)
            })?;

        tracing::info!(path = %path.display(), %kind, "channel connected");

        Ok(UnixChannel {
            stream: Some(stream),
            path: path.to_path_buf(),
            kind,
        })
    }

    /// Wrap an already-connected stream, e.g. one half of a `UnixStream::pair()`.
    pub fn from_stream(stream: UnixStream, path: impl Into<PathBuf>, kind: ChannelKind) -> Self {
        UnixChannel {
            stream: Some(stream),
            path: path.into(),
            kind,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Channel for UnixChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(path = %self.path.display(), bytes = data.len(), data = ?data, "sending");

        stream.write_all(data).await.map_err(|e| {
            tracing::warn!(path = %self.path.display(), error = %e, "write failed");
            map_io_error(e)
        })?;
        stream.flush().await.map_err(map_io_error)?;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, stream.read(buf)).await {
            Ok(Ok(0)) => {
                tracing::debug!(path = %self.path.display(), kind = %self.kind, "peer closed channel");
                Err(Error::ConnectionLost)
            }
            Ok(Ok(n)) => {
                tracing::trace!(path = %self.path.display(), bytes = n, "received");
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::warn!(path = %self.path.display(), error = %e, "read failed");
                Err(map_io_error(e))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(
                    path = %self.path.display(),
                    error = %e,
                    "shutdown failed (continuing anyway)"
                );
            }
            tracing::debug!(path = %self.path.display(), kind = %self.kind, "channel closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

fn map_connect_error(e: std::io::Error, path: &Path) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => {
            Error::Transport(format!("cannot connect to {}: {e}", path.display()))
        }
        _ => Error::Io(e),
    }
}

fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}
