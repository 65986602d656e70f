//! The `DeviceDriver` trait -- the capability set every driver variant
//! implements.
//!
//! The station registry programs against `dyn DeviceDriver` and never needs
//! to know whether a device is driven through its own vendor server or
//! through a port on the shared bridge.

use async_trait::async_trait;

use crate::error::Result;
use crate::events::{EventBus, Upstream};
use crate::state::SessionState;
use crate::types::*;

/// Asynchronous control surface for one device session.
///
/// Creating a driver starts its session immediately; there is no separate
/// "start" call. Methods that only read cached state are synchronous.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// The device this session drives.
    fn device(&self) -> &Device;

    fn kind(&self) -> DriverKind {
        self.device().kind
    }

    /// Path handed to downstream consumers to reach this device's data,
    /// e.g. `airspy:/tmp/airspy-1:4.sock`.
    fn device_path(&self) -> String;

    /// The process whose death should stall this session.
    fn upstream(&self) -> Upstream;

    /// Current lifecycle state.
    fn state(&self) -> SessionState;

    /// Resolve once the command path is usable for the first time.
    async fn init(&self) -> Result<()>;

    /// Apply one parameter, given in natural units.
    ///
    /// Unknown parameters are rejected before anything is sent, and a
    /// `ParamSetError` is published.
    async fn set_param(&self, setting: ParamSetting) -> Result<()>;

    /// Start (`true`) or stop (`false`) streaming.
    async fn start_stop(&self, on: bool) -> Result<()>;

    /// Data stopped flowing; force the session through a full restart.
    async fn stalled(&self, reason: &str) -> Result<()>;

    /// Release every resource the session owns. The session is finished
    /// when this returns.
    async fn teardown(&self) -> Result<()>;
}

/// Creates driver sessions for devices as the station adds them.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    fn create(&self, device: Device, plan: Plan, bus: EventBus)
    -> Result<Box<dyn DeviceDriver>>;

    /// Stop anything the factory shares between sessions, such as a bridge
    /// process. Called once when the station quits.
    async fn shutdown(&self) {}
}
