//! The default driver factory.
//!
//! [`DefaultFactory`] builds an Airspy session per device and routes
//! GNU Radio devices through one shared bridge, started the first time a
//! GNU Radio device is added.

#[cfg(feature = "gnuradio")]
use std::sync::OnceLock;

use async_trait::async_trait;
#[cfg(feature = "gnuradio")]
use tracing::warn;

use sdrlib_core::driver::{DeviceDriver, DriverFactory};
use sdrlib_core::error::{Error, Result};
use sdrlib_core::events::EventBus;
use sdrlib_core::types::{Device, DriverKind, Plan};

#[cfg(feature = "airspy")]
use sdrlib_airspy::AirspyBuilder;
#[cfg(feature = "gnuradio")]
use sdrlib_gnuradio::{BridgeBuilder, BridgeHandle, GnuRadioDriver};

/// Creates sessions for every driver variant compiled in.
#[derive(Default)]
pub struct DefaultFactory {
    #[cfg(feature = "airspy")]
    airspy: AirspyBuilder,
    #[cfg(feature = "gnuradio")]
    bridge_builder: BridgeBuilder,
    #[cfg(feature = "gnuradio")]
    bridge: OnceLock<BridgeHandle>,
}

#[cfg(all(feature = "airspy", feature = "gnuradio"))]
impl DefaultFactory {
    pub fn new(airspy: AirspyBuilder, bridge: BridgeBuilder) -> Self {
        Self::default().with_airspy(airspy).with_bridge(bridge)
    }
}

#[cfg(feature = "airspy")]
impl DefaultFactory {
    /// Settings for Airspy sessions.
    pub fn with_airspy(mut self, builder: AirspyBuilder) -> Self {
        self.airspy = builder;
        self
    }
}

#[cfg(feature = "gnuradio")]
impl DefaultFactory {
    /// Settings for the shared bridge. Has no effect once it is running.
    pub fn with_bridge(mut self, builder: BridgeBuilder) -> Self {
        self.bridge_builder = builder;
        self
    }

    /// The shared bridge, once a GNU Radio device has started it.
    pub fn bridge(&self) -> Option<&BridgeHandle> {
        self.bridge.get()
    }

    fn shared_bridge(&self, bus: &EventBus) -> &BridgeHandle {
        self.bridge
            .get_or_init(|| self.bridge_builder.build(bus.clone()))
    }

    async fn quit_bridge(&self) {
        if let Some(bridge) = self.bridge.get() {
            if let Err(e) = bridge.quit().await {
                warn!(error = %e, "bridge did not quit cleanly");
            }
        }
    }
}

#[cfg(not(feature = "gnuradio"))]
impl DefaultFactory {
    async fn quit_bridge(&self) {}
}

#[async_trait]
impl DriverFactory for DefaultFactory {
    fn create(&self, device: Device, plan: Plan, bus: EventBus) -> Result<Box<dyn DeviceDriver>> {
        match device.kind {
            #[cfg(feature = "airspy")]
            DriverKind::Airspy => Ok(Box::new(self.airspy.build(device, plan, bus)?)),
            #[cfg(feature = "gnuradio")]
            DriverKind::GnuRadio => {
                let bridge = self.shared_bridge(&bus).clone();
                Ok(Box::new(GnuRadioDriver::new(bridge, device, plan, bus)))
            }
            #[allow(unreachable_patterns)]
            kind => Err(Error::InvalidParameter(format!(
                "{kind} support is not compiled in"
            ))),
        }
    }

    async fn shutdown(&self) {
        self.quit_bridge().await;
    }
}
