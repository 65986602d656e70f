//! sdrlib-test-harness: Test doubles for sdrlib.
//!
//! This crate provides [`MockChannel`] for deterministic unit testing of
//! session logic without a driven process, and [`MockUnixServer`] for
//! testing against a scripted peer on a real unix socket.

pub mod mock_channel;
pub mod mock_unix;

pub use mock_channel::MockChannel;
pub use mock_unix::MockUnixServer;
