//! sdrlib-gnuradio: devices served by the shared GNU Radio bridge.
//!
//! One bridge process (`grh`) runs a flow graph per device and multiplexes
//! them all over a single unix socket. The station opens two connections
//! to it: a command channel carrying text commands and JSON replies, and a
//! data channel carrying line-oriented detections. Per-device bookkeeping
//! inside the bridge is keyed by port label (`p3`), never by separate
//! supervisors.
//!
//! # Architecture
//!
//! - [`builder`] -- [`BridgeBuilder`] and the bridge configuration
//! - [`bridge`] -- the bridge task and its [`BridgeHandle`]
//! - [`raw`] -- [`RawStream`], an extra connection carrying one port's raw output
//! - [`driver`] -- [`GnuRadioDriver`], the per-device [`DeviceDriver`](sdrlib_core::DeviceDriver)

pub mod bridge;
pub mod builder;
pub mod driver;
pub mod raw;

pub use bridge::BridgeHandle;
pub use builder::{BridgeBuilder, BridgeConfig};
pub use driver::GnuRadioDriver;
pub use raw::RawStream;
