//! AirspyBuilder -- fluent builder for Airspy device sessions.
//!
//! Separates configuration (where the server binary lives, where sockets
//! go, timing) from starting a session for a particular device.
//!
//! # Example
//!
//! ```no_run
//! use sdrlib_airspy::AirspyBuilder;
//! use sdrlib_core::{Device, DriverKind, EventBus, Plan};
//! use std::time::Duration;
//!
//! # async fn example() -> sdrlib_core::Result<()> {
//! let bus = EventBus::default();
//! let device = Device::new("1:4", 2, DriverKind::Airspy).with_serial("a74068c82f4e3c53");
//! let plan = Plan::new(6_000_000).with_param("frequency", 166.376);
//! let driver = AirspyBuilder::new()
//!     .socket_dir("/run/sdr")
//!     .reconnect_delay(Duration::from_secs(5))
//!     .build(device, plan, bus)?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use sdrlib_core::error::Result;
use sdrlib_core::events::EventBus;
use sdrlib_core::types::{Device, Plan};
use sdrlib_core::units::ParamTable;
use sdrlib_transport::ReadyMarker;

use crate::commands::{HARDWARE_RATE, REPLY_HEADER_LEN};
use crate::driver::AirspyDriver;

/// Default location of the server binary.
pub const DEFAULT_PROGRAM: &str = "/usr/local/bin/airspy_tcp";

/// Settings shared by every Airspy session a builder creates.
#[derive(Debug, Clone)]
pub struct AirspyConfig {
    pub program: PathBuf,
    pub socket_dir: PathBuf,
    pub hardware_rate: u32,
    /// Duration of samples held in one USB transfer.
    pub buffered: Duration,
    /// USB transfer size alignment in bytes.
    pub usb_alignment: usize,
    pub header_len: usize,
    pub ready_marker: String,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    /// How long `set_param_confirmed` waits for the settings reply.
    pub reply_timeout: Duration,
    pub table: ParamTable,
}

impl AirspyConfig {
    /// Socket path for `device`, unique per USB path.
    ///
    /// ```
    /// use sdrlib_airspy::AirspyConfig;
    /// use sdrlib_core::{Device, DriverKind};
    ///
    /// let cfg = AirspyConfig::default();
    /// let dev = Device::new("1:4", 2, DriverKind::Airspy);
    /// assert_eq!(cfg.socket_path(&dev).to_str(), Some("/tmp/airspy-1:4.sock"));
    /// ```
    pub fn socket_path(&self, device: &Device) -> PathBuf {
        self.socket_dir.join(format!("airspy-{}.sock", device.usb_path))
    }
}

impl Default for AirspyConfig {
    fn default() -> Self {
        AirspyConfig {
            program: PathBuf::from(DEFAULT_PROGRAM),
            socket_dir: PathBuf::from("/tmp"),
            hardware_rate: HARDWARE_RATE,
            buffered: Duration::from_millis(8),
            usb_alignment: 512,
            header_len: REPLY_HEADER_LEN,
            ready_marker: "Listening".into(),
            reconnect_delay: Duration::from_millis(5001),
            connect_timeout: Duration::from_secs(2),
            reply_timeout: Duration::from_secs(2),
            table: ParamTable::standard(),
        }
    }
}

/// Fluent builder for [`AirspyDriver`].
#[derive(Debug, Clone, Default)]
pub struct AirspyBuilder {
    config: AirspyConfig,
}

impl AirspyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the `airspy_tcp` binary.
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.config.program = program.into();
        self
    }

    /// Directory that holds the per-device sockets (default `/tmp`).
    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.socket_dir = dir.into();
        self
    }

    pub fn hardware_rate(mut self, rate: u32) -> Self {
        self.config.hardware_rate = rate;
        self
    }

    /// Sample duration per USB transfer (default 8 ms).
    pub fn buffered(mut self, d: Duration) -> Self {
        self.config.buffered = d;
        self
    }

    pub fn usb_alignment(mut self, bytes: usize) -> Self {
        self.config.usb_alignment = bytes;
        self
    }

    /// Bytes of binary header ahead of the first reply (default 12).
    pub fn header_len(mut self, len: usize) -> Self {
        self.config.header_len = len;
        self
    }

    /// Stdout text that means the server is accepting connections.
    pub fn ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.config.ready_marker = marker.into();
        self
    }

    /// Delay before reconnecting a lost command channel (default 5001 ms).
    pub fn reconnect_delay(mut self, d: Duration) -> Self {
        self.config.reconnect_delay = d;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.config.connect_timeout = d;
        self
    }

    pub fn reply_timeout(mut self, d: Duration) -> Self {
        self.config.reply_timeout = d;
        self
    }

    pub fn param_table(mut self, table: ParamTable) -> Self {
        self.config.table = table;
        self
    }

    pub fn config(&self) -> &AirspyConfig {
        &self.config
    }

    /// Start a session for `device`. The server is launched immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(&self, device: Device, plan: Plan, bus: EventBus) -> Result<AirspyDriver> {
        Ok(AirspyDriver::start(self.config.clone(), device, plan, bus))
    }
}

pub(crate) fn ready_marker(config: &AirspyConfig) -> ReadyMarker {
    ReadyMarker::Contains(config.ready_marker.clone())
}
