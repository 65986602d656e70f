//! Mock channel for deterministic testing of session logic.
//!
//! [`MockChannel`] implements the [`Channel`] trait with pre-loaded
//! request/response pairs, plus unsolicited inbound bytes for headers and
//! asynchronous notifications.
//!
//! # Example
//!
//! ```
//! use sdrlib_core::ChannelKind;
//! use sdrlib_test_harness::MockChannel;
//!
//! let mut mock = MockChannel::new(ChannelKind::Command);
//! // When the session writes a frequency command, answer with a snapshot.
//! mock.expect(&[0x01, 0x09, 0xEA, 0xB2, 0x40], b"{\"frequency\":166376000}\n");
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;

use sdrlib_core::error::{Error, Result};
use sdrlib_core::transport::{Channel, ChannelKind};

#[derive(Debug, Clone)]
struct Expectation {
    request: Vec<u8>,
    response: Vec<u8>,
}

/// A scripted [`Channel`].
///
/// Every `send()` is recorded and matched against the next expectation;
/// the matching response is queued for `receive()`. With nothing queued,
/// `receive()` waits out its timeout and reports [`Error::Timeout`], or
/// [`Error::ConnectionLost`] once [`hang_up`](MockChannel::hang_up) has
/// been called.
#[derive(Debug)]
pub struct MockChannel {
    kind: ChannelKind,
    expectations: VecDeque<Expectation>,
    inbound: VecDeque<u8>,
    connected: bool,
    hung_up: bool,
    sent_log: Vec<Vec<u8>>,
}

impl MockChannel {
    /// Create a connected mock of the given kind.
    pub fn new(kind: ChannelKind) -> Self {
        MockChannel {
            kind,
            expectations: VecDeque::new(),
            inbound: VecDeque::new(),
            connected: true,
            hung_up: false,
            sent_log: Vec::new(),
        }
    }

    /// Add an expected request/response pair. An empty response means the
    /// peer stays silent.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Queue bytes the peer sends without being asked.
    pub fn push_inbound(&mut self, data: &[u8]) {
        self.inbound.extend(data);
    }

    /// Make the peer close once queued bytes have been read.
    pub fn hang_up(&mut self) {
        self.hung_up = true;
    }

    /// Every `send()` so far, one entry per call.
    pub fn sent_data(&self) -> &[Vec<u8>] {
        &self.sent_log
    }

    pub fn remaining_expectations(&self) -> usize {
        self.expectations.len()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if self.hung_up {
            return Err(Error::ConnectionLost);
        }

        self.sent_log.push(data.to_vec());

        let Some(expectation) = self.expectations.pop_front() else {
            return Err(Error::Protocol("no more expectations in mock channel".into()));
        };
        if data != expectation.request.as_slice() {
            return Err(Error::Protocol(format!(
                "unexpected send data: expected {:02X?}, got {:02X?}",
                expectation.request, data
            )));
        }
        self.inbound.extend(expectation.response);
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if self.inbound.is_empty() {
            if self.hung_up {
                self.connected = false;
                return Err(Error::ConnectionLost);
            }
            tokio::time::sleep(timeout).await;
            return Err(Error::Timeout);
        }
        let n = self.inbound.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.inbound.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQ: [u8; 5] = [0x01, 0x09, 0xEA, 0xB2, 0x40];

    #[tokio::test]
    async fn scripted_reply() {
        let mut mock = MockChannel::new(ChannelKind::Command);
        mock.expect(&FREQ, b"{\"frequency\":166376000}\n");
        mock.send(&FREQ).await.unwrap();

        let mut buf = [0u8; 64];
        let n = mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], b"{\"frequency\":166376000}\n");
        assert_eq!(mock.sent_data(), &[FREQ.to_vec()]);
        assert_eq!(mock.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn partial_reads() {
        let mut mock = MockChannel::new(ChannelKind::Command);
        mock.push_inbound(&[0xAA, 0xBB, 0xCC]);
        let mut buf = [0u8; 2];
        assert_eq!(mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap(), 2);
        assert_eq!(buf, [0xAA, 0xBB]);
        assert_eq!(mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap(), 1);
        assert_eq!(buf[0], 0xCC);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_receive_times_out() {
        let mut mock = MockChannel::new(ChannelKind::Data);
        let mut buf = [0u8; 8];
        assert!(matches!(
            mock.receive(&mut buf, Duration::from_secs(30)).await,
            Err(Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn hang_up_after_draining() {
        let mut mock = MockChannel::new(ChannelKind::Command);
        mock.push_inbound(b"x\n");
        mock.hang_up();
        let mut buf = [0u8; 8];
        assert_eq!(mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap(), 2);
        assert!(matches!(
            mock.receive(&mut buf, Duration::from_millis(10)).await,
            Err(Error::ConnectionLost)
        ));
        assert!(!mock.is_connected());
    }

    #[tokio::test]
    async fn wrong_request_is_protocol_error() {
        let mut mock = MockChannel::new(ChannelKind::Command);
        mock.expect(&FREQ, b"");
        assert!(matches!(mock.send(&[15, 0, 0, 0, 1]).await, Err(Error::Protocol(_))));
        assert!(matches!(mock.send(&FREQ).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn closed_channel_refuses_io() {
        let mut mock = MockChannel::new(ChannelKind::Command);
        mock.close().await.unwrap();
        mock.close().await.unwrap();
        assert!(matches!(mock.send(&FREQ).await, Err(Error::NotConnected)));
    }
}
