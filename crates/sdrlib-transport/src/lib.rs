//! Process and channel plumbing for sdrlib.
//!
//! This crate provides the two leaf components every device session is built
//! from:
//!
//! - [`ProcessSupervisor`]: launches one driven process at a time, watches
//!   its output for a readiness marker, reports its exit, and decides
//!   whether to restart it.
//! - [`UnixChannel`] and [`ChannelManager`]: connections to the process's
//!   listening unix socket, with idempotent connect, delayed reconnect, and
//!   safe repeated disconnect.

pub mod manager;
pub mod process;
pub mod unix;

pub use manager::{ChannelManager, ConnectOutcome};
pub use process::{
    ChildProcess, ExitDecision, ExitOutcome, ProcessEvent, ProcessSpec, ProcessSupervisor,
    ReadyMarker, SupervisorEvent, remove_stale_socket,
};
pub use unix::UnixChannel;

use tokio::time::Instant;

/// Sleep until `deadline`, or forever if there is none.
///
/// Session loops keep their timers as optional deadlines and wait on them
/// with this in a `select!` arm; clearing the deadline cancels the timer.
pub async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
