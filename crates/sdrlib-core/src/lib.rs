//! sdrlib-core: Core traits, types, and error definitions for sdrlib.
//!
//! This crate defines the driver-agnostic pieces that every device session
//! shares. The station registry and each driver variant depend on these
//! types without depending on each other.
//!
//! # Key types
//!
//! - [`DeviceDriver`] -- the capability set every driver variant implements
//! - [`Channel`] -- byte-level connection to a driven process
//! - [`StationEvent`] / [`EventBus`] -- cross-component notifications
//! - [`SessionState`] -- the per-device lifecycle
//! - [`HealthMonitor`] -- throughput hysteresis and stall detection
//! - [`Error`] / [`Result`] -- error handling

pub mod driver;
pub mod error;
pub mod events;
pub mod health;
pub mod state;
pub mod transport;
pub mod types;
pub mod units;

// Re-export key types at crate root for ergonomic `use sdrlib_core::*`.
pub use driver::{DeviceDriver, DriverFactory};
pub use error::{Error, Result};
pub use events::{EventBus, StationEvent, Upstream};
pub use health::{HealthConfig, HealthEvent, HealthMonitor, HealthReport, StatusEntry};
pub use state::SessionState;
pub use transport::{Channel, ChannelKind};
pub use types::*;
pub use units::{ParamSpec, ParamTable, Unit};
