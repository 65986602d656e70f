//! Mock unix-socket peer for protocol-level testing.
//!
//! [`MockUnixServer`] binds a unix socket, accepts one connection, sends an
//! optional greeting (such as a binary header), then works through scripted
//! request/response pairs. It stands in for a driven process's control
//! socket when a test wants real socket I/O without a real process.
//!
//! # Example
//!
//! ```no_run
//! use sdrlib_test_harness::MockUnixServer;
//!
//! # async fn example() -> sdrlib_core::Result<()> {
//! let mut server = MockUnixServer::new("/tmp/airspy-1:4.sock");
//! server.greeting(&[0u8; 12]);
//! server.expect(&[0x0F, 0, 0, 0, 1], b"{\"streaming\":1}\n");
//! let ready = server.start_with_ready();
//! ready.await.ok();
//! // ... connect a session and drive it ...
//! server.wait().await.ok();
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct Expectation {
    request: Vec<u8>,
    response: Vec<u8>,
}

/// A scripted peer on a unix socket.
///
/// If the client sends data that does not match the next expectation the
/// server stops and [`wait`](MockUnixServer::wait) reports the mismatch.
pub struct MockUnixServer {
    path: PathBuf,
    greeting: Vec<u8>,
    expectations: VecDeque<Expectation>,
    hold_open: bool,
    server_handle: Option<JoinHandle<std::result::Result<(), String>>>,
}

impl MockUnixServer {
    /// A server for `path`. Nothing is bound until it is started.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MockUnixServer {
            path: path.into(),
            greeting: Vec::new(),
            expectations: VecDeque::new(),
            hold_open: false,
            server_handle: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written as soon as the client connects.
    pub fn greeting(&mut self, data: &[u8]) {
        self.greeting = data.to_vec();
    }

    /// Add an expected request/response pair, consumed in order.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// After the script, keep the connection open until the client closes
    /// it instead of hanging up.
    pub fn hold_open(&mut self) {
        self.hold_open = true;
    }

    /// Bind, then serve one connection in a background task. The returned
    /// receiver fires once the socket is bound.
    pub fn start_with_ready(&mut self) -> oneshot::Receiver<()> {
        let path = self.path.clone();
        let greeting = std::mem::take(&mut self.greeting);
        let expectations: Vec<Expectation> = self.expectations.drain(..).collect();
        let hold_open = self.hold_open;
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let listener = UnixListener::bind(&path)
                .map_err(|e| format!("failed to bind {}: {}", path.display(), e))?;
            let _ = ready_tx.send(());

            let (mut stream, _) = listener
                .accept()
                .await
                .map_err(|e| format!("failed to accept connection: {}", e))?;

            if !greeting.is_empty() {
                stream
                    .write_all(&greeting)
                    .await
                    .map_err(|e| format!("greeting write error: {}", e))?;
            }

            for (i, expectation) in expectations.iter().enumerate() {
                let mut buf = vec![0u8; expectation.request.len()];
                stream.read_exact(&mut buf).await.map_err(|e| {
                    format!(
                        "expectation {}: read error (expected {} bytes): {}",
                        i,
                        expectation.request.len(),
                        e
                    )
                })?;

                if buf != expectation.request {
                    return Err(format!(
                        "expectation {}: request mismatch: expected {:02X?}, got {:02X?}",
                        i, expectation.request, buf
                    ));
                }

                stream
                    .write_all(&expectation.response)
                    .await
                    .map_err(|e| format!("expectation {}: write error: {}", i, e))?;
            }

            if hold_open {
                let mut sink = [0u8; 256];
                while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
            }
            Ok(())
        });

        self.server_handle = Some(handle);
        ready_rx
    }

    /// Wait for the script to finish and return any mismatch.
    pub async fn wait(self) -> std::result::Result<(), String> {
        match self.server_handle {
            Some(handle) => handle
                .await
                .map_err(|e| format!("server task panicked: {}", e))?,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn greeting_then_scripted_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("airspy-1:4.sock");
        let mut server = MockUnixServer::new(&path);
        server.greeting(b"RTL0\0\0\0\0\0\0\0\0");
        server.expect(&[15, 0, 0, 0, 1], b"{\"streaming\":1}\n");
        server.start_with_ready().await.unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        let mut header = [0u8; 12];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..4], b"RTL0");

        client.write_all(&[15, 0, 0, 0, 1]).await.unwrap();
        let mut reply = vec![0u8; 16];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b"{\"streaming\":1}\n");

        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grh.sock");
        let mut server = MockUnixServer::new(&path);
        server.expect(b"list\n", b"{}\n");
        server.start_with_ready().await.unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(b"quit\n").await.unwrap();
        let err = server.wait().await.unwrap_err();
        assert!(err.contains("request mismatch"), "{err}");
    }
}
