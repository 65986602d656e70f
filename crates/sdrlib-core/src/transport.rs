//! Channel trait for talking to a driven process.
//!
//! A [`Channel`] is one byte-stream connection to a process the station
//! launched: a command channel carrying requests and replies, or a data
//! channel carrying the sample stream. Session loops own their channels
//! exclusively and poll [`receive`](Channel::receive) from their select loop,
//! so implementations must make `receive` cancellation-safe.
//!
//! Concrete implementations live in `sdrlib-transport` (unix sockets) and
//! `sdrlib-test-harness` (scripted mocks).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// What a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Requests out, replies and notifications back.
    Command,
    /// Raw sample or line stream; never carries replies.
    Data,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Command => write!(f, "command"),
            ChannelKind::Data => write!(f, "data"),
        }
    }
}

/// Asynchronous byte-level connection to a driven process.
#[async_trait]
pub trait Channel: Send + Sync {
    /// What this channel carries.
    fn kind(&self) -> ChannelKind;

    /// Write all of `data` to the peer.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Read available bytes into `buf`.
    ///
    /// Waits up to `timeout` and returns [`Error::Timeout`](crate::Error::Timeout)
    /// if nothing arrived, and [`Error::ConnectionLost`](crate::Error::ConnectionLost)
    /// once the peer has closed the connection.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the connection. Closing twice is harmless.
    async fn close(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;
}
