//! sdrlib-airspy: sessions for Airspy receivers driven through `airspy_tcp`.
//!
//! Each device gets its own `airspy_tcp` process listening on a unix
//! socket. The station holds one command connection to it; the downstream
//! sample consumer opens the second. Commands are 5-byte binary frames and
//! the server answers every command with a JSON snapshot of its settings.
//!
//! # Architecture
//!
//! - [`commands`] -- command table, 5-byte encoding, rate and buffer sizing
//! - [`builder`] -- [`AirspyBuilder`] and the session configuration
//! - [`session`] -- the per-device task that runs the lifecycle
//! - [`driver`] -- [`AirspyDriver`], the [`DeviceDriver`](sdrlib_core::DeviceDriver) handle

pub mod builder;
pub mod commands;
pub mod driver;
pub mod session;

pub use builder::{AirspyBuilder, AirspyConfig};
pub use driver::AirspyDriver;
