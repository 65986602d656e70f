//! BridgeBuilder -- fluent builder for the shared bridge.
//!
//! # Example
//!
//! ```no_run
//! use sdrlib_core::EventBus;
//! use sdrlib_gnuradio::BridgeBuilder;
//!
//! # async fn example() {
//! let bus = EventBus::default();
//! let bridge = BridgeBuilder::new()
//!     .program("/usr/local/bin/grh")
//!     .reap_stale(true)
//!     .build(bus);
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use sdrlib_core::events::EventBus;
use sdrlib_core::health::HealthConfig;
use sdrlib_core::units::ParamTable;

use crate::bridge::BridgeHandle;

/// Default location of the bridge binary.
pub const DEFAULT_PROGRAM: &str = "/usr/local/bin/grh";

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub program: PathBuf,
    pub socket_dir: PathBuf,
    /// File name of the bridge socket inside `socket_dir`; passed to the
    /// bridge with `-s`.
    pub socket_name: String,
    /// Delay before relaunching a dead bridge.
    pub respawn_delay: Duration,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub health: HealthConfig,
    /// Kill leftover bridge processes before the first launch.
    pub reap_stale: bool,
    pub table: ParamTable,
}

impl BridgeConfig {
    /// Full path of the bridge socket.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(&self.socket_name)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            program: PathBuf::from(DEFAULT_PROGRAM),
            socket_dir: PathBuf::from("/tmp"),
            socket_name: "gnuradio.sock".into(),
            respawn_delay: Duration::from_millis(5000),
            reconnect_delay: Duration::from_millis(5001),
            connect_timeout: Duration::from_secs(2),
            health: HealthConfig::default(),
            reap_stale: false,
            table: ParamTable::standard(),
        }
    }
}

/// Fluent builder for [`BridgeHandle`].
#[derive(Debug, Clone, Default)]
pub struct BridgeBuilder {
    config: BridgeConfig,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.config.program = program.into();
        self
    }

    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.socket_dir = dir.into();
        self
    }

    pub fn socket_name(mut self, name: impl Into<String>) -> Self {
        self.config.socket_name = name.into();
        self
    }

    /// Delay before a dead bridge is relaunched (default 5000 ms).
    pub fn respawn_delay(mut self, d: Duration) -> Self {
        self.config.respawn_delay = d;
        self
    }

    /// Delay before a lost channel is reconnected (default 5001 ms).
    pub fn reconnect_delay(mut self, d: Duration) -> Self {
        self.config.reconnect_delay = d;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.config.connect_timeout = d;
        self
    }

    /// Interval between rate checks (default 10 s).
    pub fn check_interval(mut self, d: Duration) -> Self {
        self.config.health.interval = d;
        self
    }

    /// Rate tolerance in percent (default 5).
    pub fn tolerance_pct(mut self, pct: f64) -> Self {
        self.config.health.tolerance_pct = pct;
        self
    }

    /// Consecutive out-of-band checks before a stall (default 2).
    pub fn max_out_of_bounds(mut self, n: u32) -> Self {
        self.config.health.max_out_of_bounds = n;
        self
    }

    /// Run `killall -KILL <program name>` before the first launch.
    pub fn reap_stale(mut self, reap: bool) -> Self {
        self.config.reap_stale = reap;
        self
    }

    pub fn param_table(mut self, table: ParamTable) -> Self {
        self.config.table = table;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start the bridge task. The bridge process is launched right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(&self, bus: EventBus) -> BridgeHandle {
        BridgeHandle::start(self.config.clone(), bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = BridgeConfig::default();
        assert_eq!(c.socket_path(), PathBuf::from("/tmp/gnuradio.sock"));
        assert_eq!(c.respawn_delay, Duration::from_millis(5000));
        assert_eq!(c.reconnect_delay, Duration::from_millis(5001));
        assert_eq!(c.health.interval, Duration::from_secs(10));
        assert_eq!(c.health.max_out_of_bounds, 2);
        assert!(!c.reap_stale);
    }

    #[test]
    fn overrides() {
        let b = BridgeBuilder::new()
            .socket_dir("/run/sdr")
            .socket_name("grh.sock")
            .check_interval(Duration::from_secs(1))
            .tolerance_pct(10.0)
            .max_out_of_bounds(3)
            .reap_stale(true);
        assert_eq!(b.config().socket_path(), PathBuf::from("/run/sdr/grh.sock"));
        assert_eq!(b.config().health.interval, Duration::from_secs(1));
        assert_eq!(b.config().health.tolerance_pct, 10.0);
        assert_eq!(b.config().health.max_out_of_bounds, 3);
        assert!(b.config().reap_stale);
    }
}
