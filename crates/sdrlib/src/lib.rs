//! # sdrlib -- Supervised SDR Device Sessions
//!
//! `sdrlib` keeps the software-defined radios of a receiver station running.
//! For each attached device it launches the process that talks to the
//! hardware, connects to that process's sockets, translates parameters
//! between natural and device-native units, and brings the device back
//! after crashes, USB glitches, and data stalls.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sdrlib::{
//!     Device, DriverKind, EventBus, Plan, Station, StationConfig, StaticPlans, StaticSerials,
//! };
//! use sdrlib::airspy::AirspyBuilder;
//! use sdrlib::gnuradio::BridgeBuilder;
//! use sdrlib::factory::DefaultFactory;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::default();
//!     let plans = StaticPlans::new()
//!         .with_fallback(Plan::new(48_000).with_param("frequency", 166.376));
//!     let factory = DefaultFactory::new(AirspyBuilder::new(), BridgeBuilder::new());
//!     let station = Station::start(
//!         StationConfig::default(),
//!         Arc::new(plans),
//!         Arc::new(StaticSerials::new()),
//!         Arc::new(factory),
//!         bus,
//!     );
//!     station.add_device(Device::new("1:4", 2, DriverKind::Airspy));
//!     tokio::signal::ctrl_c().await.ok();
//!     station.quit().await;
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                 | Purpose                                          |
//! |-----------------------|--------------------------------------------------|
//! | `sdrlib-core`         | Data model, events, units, states, health checks |
//! | `sdrlib-transport`    | Child processes and unix-socket channels         |
//! | `sdrlib-text-io`      | Line framing and command/reply correlation       |
//! | `sdrlib-airspy`       | One `airspy_tcp` server per device               |
//! | `sdrlib-gnuradio`     | Ports multiplexed through the shared bridge      |
//! | **`sdrlib`**          | This facade -- re-exports plus the [`Station`]   |
//!
//! Every driver variant implements [`DeviceDriver`], so the station works
//! with `dyn DeviceDriver` and never depends on a concrete variant.
//!
//! ## Feature Flags
//!
//! | Feature    | Enables                        | Default |
//! |------------|--------------------------------|---------|
//! | `airspy`   | [`airspy`] module              | yes     |
//! | `gnuradio` | [`gnuradio`] module            | yes     |
//! | `full`     | Every driver variant           | no      |

pub use sdrlib_core::*;

pub mod factory;
pub mod station;

pub use station::{DeviceStatus, Station, StationConfig};

/// Airspy backend: one `airspy_tcp` server and command socket per device.
#[cfg(feature = "airspy")]
pub mod airspy {
    pub use sdrlib_airspy::*;
}

/// GNU Radio backend: ports served by one shared bridge process.
#[cfg(feature = "gnuradio")]
pub mod gnuradio {
    pub use sdrlib_gnuradio::*;
}

/// Driver variants compiled into this build.
///
/// ```
/// let kinds = sdrlib::supported_drivers();
/// assert!(!kinds.is_empty());
/// ```
pub fn supported_drivers() -> Vec<DriverKind> {
    let mut kinds = Vec::new();
    #[cfg(feature = "airspy")]
    kinds.push(DriverKind::Airspy);
    #[cfg(feature = "gnuradio")]
    kinds.push(DriverKind::GnuRadio);
    kinds
}
