//! GnuRadioDriver -- the [`DeviceDriver`] for one port served by the bridge.
//!
//! The driver owns no process and no socket. It validates parameters,
//! formats text commands, and forwards them through the shared
//! [`BridgeHandle`]. A stall restarts only this port: the bridge keeps
//! running for the others.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{info, warn};

use sdrlib_core::driver::DeviceDriver;
use sdrlib_core::error::{Error, Result};
use sdrlib_core::events::{EventBus, StationEvent, Upstream};
use sdrlib_core::state::SessionState;
use sdrlib_core::transport::ChannelKind;
use sdrlib_core::types::{Device, DriverKind, ParamSetting, Plan};
use sdrlib_core::units::ParamTable;

use crate::bridge::BridgeHandle;
use crate::raw::RawStream;

/// Per-device handle onto the shared bridge.
pub struct GnuRadioDriver {
    device: Device,
    bridge: BridgeHandle,
    bus: EventBus,
    table: ParamTable,
    rate: u32,
    /// Set once the port leaves the bridge's lifecycle (restart or teardown).
    local: Mutex<Option<SessionState>>,
}

impl GnuRadioDriver {
    pub fn new(bridge: BridgeHandle, device: Device, plan: Plan, bus: EventBus) -> Self {
        let rate = plan.effective_rate();
        info!(
            port = device.port,
            usb_path = %device.usb_path,
            rate,
            "starting gnuradio session"
        );
        GnuRadioDriver {
            table: bridge.config().table,
            device,
            bridge,
            bus,
            rate,
            local: Mutex::new(None),
        }
    }

    /// Label the bridge uses for this port.
    pub fn label(&self) -> String {
        self.device.label()
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn bridge(&self) -> &BridgeHandle {
        &self.bridge
    }

    /// Open a raw output stream for this port at the plan rate.
    pub async fn open_raw_stream(&self, fm: bool) -> Result<RawStream> {
        self.bridge
            .open_raw_stream(&self.label(), self.rate, fm)
            .await
    }

    fn local(&self) -> Option<SessionState> {
        *self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a local state; returns the previous one.
    fn set_local(&self, state: SessionState) -> Option<SessionState> {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(state)
    }

    fn check_live(&self) -> Result<()> {
        match self.local() {
            Some(SessionState::Terminated) => Err(Error::Terminated),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceDriver for GnuRadioDriver {
    fn device(&self) -> &Device {
        &self.device
    }

    fn device_path(&self) -> String {
        let sock = self
            .bridge
            .config()
            .socket_dir
            .join(format!("gnuradio-{}.sock", self.device.usb_path));
        format!("gnuradio:{}", sock.display())
    }

    fn upstream(&self) -> Upstream {
        Upstream::Bridge
    }

    fn state(&self) -> SessionState {
        self.local().unwrap_or_else(|| self.bridge.state())
    }

    async fn init(&self) -> Result<()> {
        // Commands queue inside the bridge until its channel is up.
        self.check_live()
    }

    async fn set_param(&self, setting: ParamSetting) -> Result<()> {
        self.check_live()?;
        if let Err(e) = self.table.lookup(&setting.name) {
            warn!(
                port = self.device.port,
                param = %setting.name,
                value = setting.value,
                error = %e,
                "parameter rejected"
            );
            self.bus.publish(StationEvent::ParamSetError {
                port: self.device.port,
                driver: DriverKind::GnuRadio,
                param: setting.name.clone(),
                value: setting.value,
                error: e.to_string(),
            });
            return Err(e);
        }
        let line = format!("{} {} {}", setting.name, self.device.port, setting.value);
        self.bridge
            .submit(ChannelKind::Command, vec![line], None)
            .await
    }

    async fn start_stop(&self, on: bool) -> Result<()> {
        self.check_live()?;
        info!(port = self.device.port, on, "gnuradio start/stop");
        self.bridge.start_stop(on, self.device.port).await?;
        if on {
            self.bridge.accept(&self.label()).await?;
        }
        Ok(())
    }

    async fn stalled(&self, reason: &str) -> Result<()> {
        match self.local() {
            Some(SessionState::Terminated) | Some(SessionState::Restarting) => return Ok(()),
            _ => {}
        }
        warn!(port = self.device.port, reason, "gnuradio port stalled, restarting");
        self.set_local(SessionState::Restarting);
        if let Err(e) = self.bridge.start_stop(false, self.device.port).await {
            warn!(port = self.device.port, error = %e, "could not stop stalled port");
        }
        self.bus.publish(StationEvent::RestartRequested {
            device: self.device.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        let previous = self.set_local(SessionState::Terminated);
        if previous == Some(SessionState::Terminated) {
            return Ok(());
        }
        // The bridge may already be gone during station shutdown.
        if let Err(e) = self.bridge.start_stop(false, self.device.port).await {
            info!(port = self.device.port, error = %e, "port not stopped on teardown");
        }
        Ok(())
    }
}
