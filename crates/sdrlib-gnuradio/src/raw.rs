//! Raw output streams.
//!
//! A raw stream is a separate connection to the bridge socket that carries
//! one port's output, optionally FM-demodulated, at a requested rate. It is
//! not managed by the bridge task: the caller owns it and closes it.

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use sdrlib_core::error::Result;
use sdrlib_core::transport::{Channel, ChannelKind};
use sdrlib_transport::UnixChannel;

/// A connection carrying raw output for one port label.
#[derive(Debug)]
pub struct RawStream {
    channel: UnixChannel,
    label: String,
    rate: u32,
    fm: bool,
    started: bool,
}

impl RawStream {
    pub(crate) async fn open(
        path: PathBuf,
        label: &str,
        rate: u32,
        fm: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let channel = UnixChannel::connect_with_timeout(&path, ChannelKind::Data, timeout).await?;
        Ok(RawStream {
            channel,
            label: label.to_string(),
            rate,
            fm,
            started: false,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn fm(&self) -> bool {
        self.fm
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Ask the bridge to start sending.
    pub async fn start(&mut self) -> Result<()> {
        let fm = u8::from(self.fm);
        info!(label = %self.label, rate = self.rate, fm, "starting raw stream");
        let line = format!("rawStream {} {} {}\n", self.label, self.rate, fm);
        self.channel.send(line.as_bytes()).await?;
        self.started = true;
        Ok(())
    }

    /// Read raw bytes, waiting up to `timeout`.
    pub async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.channel.receive(buf, timeout).await
    }

    /// Ask the bridge to stop sending, then close the connection.
    pub async fn stop(mut self) -> Result<()> {
        if self.started {
            let line = format!("rawStreamOff {}\n", self.label);
            self.channel.send(line.as_bytes()).await?;
            self.started = false;
        }
        self.channel.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdrlib_test_harness::MockUnixServer;

    #[tokio::test]
    async fn start_and_stop_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gnuradio.sock");
        let mut server = MockUnixServer::new(&path);
        server.expect(b"rawStream p2 48000 1\n", b"\x01\x02\x03\x04");
        server.expect(b"rawStreamOff p2\n", b"");
        server.start_with_ready().await.unwrap();

        let mut stream = RawStream::open(path, "p2", 48_000, true, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!stream.is_started());
        stream.start().await.unwrap();

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4]);

        stream.stop().await.unwrap();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gnuradio.sock");
        let mut server = MockUnixServer::new(&path);
        server.hold_open();
        server.start_with_ready().await.unwrap();

        let stream = RawStream::open(path, "p1", 24_000, false, Duration::from_secs(1))
            .await
            .unwrap();
        stream.stop().await.unwrap();
        server.wait().await.unwrap();
    }
}
