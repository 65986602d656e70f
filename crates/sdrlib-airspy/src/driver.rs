//! AirspyDriver -- the [`DeviceDriver`] handle for one Airspy session.
//!
//! The handle is cheap: it encodes parameters, validates them against the
//! command table, and forwards frames to the session task. Everything that
//! touches the process or the socket happens inside the task.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sdrlib_core::driver::DeviceDriver;
use sdrlib_core::error::{Error, Result};
use sdrlib_core::events::{EventBus, StationEvent, Upstream};
use sdrlib_core::state::SessionState;
use sdrlib_core::types::{Device, DriverKind, ParamSetting, Plan, Settings};
use sdrlib_core::units::ParamTable;
use sdrlib_text_io::ReplyHandler;

use crate::builder::AirspyConfig;
use crate::commands::encode_param;
use crate::session::{Session, SessionRequest};

/// Handle to a running Airspy session.
///
/// Created by [`AirspyBuilder::build`](crate::AirspyBuilder::build). The
/// server process is launched as soon as the handle exists.
pub struct AirspyDriver {
    device: Device,
    socket_path: PathBuf,
    table: ParamTable,
    bus: EventBus,
    rate: u32,
    reply_timeout: Duration,
    requests: mpsc::Sender<SessionRequest>,
    state: watch::Receiver<SessionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AirspyDriver {
    pub(crate) fn start(config: AirspyConfig, device: Device, plan: Plan, bus: EventBus) -> Self {
        let rate = plan.effective_rate();
        info!(
            port = device.port,
            usb_path = %device.usb_path,
            rate,
            hw_rate = config.hardware_rate,
            "starting airspy session"
        );

        let (requests, rx) = mpsc::channel(32);
        let (state_tx, state) = watch::channel(SessionState::Idle);
        let socket_path = config.socket_path(&device);
        let table = config.table;
        let reply_timeout = config.reply_timeout;
        let session = Session::new(config, device.clone(), bus.clone(), state_tx);
        let task = tokio::spawn(session.run(rx));

        AirspyDriver {
            device,
            socket_path,
            table,
            bus,
            rate,
            reply_timeout,
            requests,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    /// The control socket this session's server listens on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The plan rate this session serves, after fallback.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Watch the session's lifecycle state.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Apply a parameter and wait for the settings snapshot the server
    /// sends back, in natural units.
    pub async fn set_param_confirmed(&self, setting: ParamSetting) -> Result<Settings> {
        let frame = self.encode(&setting)?;
        let (handler, rx) = ReplyHandler::single();
        self.send(SessionRequest::Command {
            frame: frame.to_vec(),
            handler: Some(handler),
        })
        .await?;

        let reply = match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::Terminated),
            Err(_) => return Err(Error::Timeout),
        };
        match reply {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(Error::Protocol(format!("unexpected settings reply: {other}"))),
        }
    }

    fn encode(&self, setting: &ParamSetting) -> Result<Bytes> {
        encode_param(&self.table, &setting.name, setting.value).inspect_err(|e| {
            warn!(
                port = self.device.port,
                param = %setting.name,
                value = setting.value,
                error = %e,
                "parameter rejected"
            );
            self.bus.publish(StationEvent::ParamSetError {
                port: self.device.port,
                driver: DriverKind::Airspy,
                param: setting.name.clone(),
                value: setting.value,
                error: e.to_string(),
            });
        })
    }

    async fn send(&self, req: SessionRequest) -> Result<()> {
        self.requests.send(req).await.map_err(|_| Error::Terminated)
    }
}

#[async_trait]
impl DeviceDriver for AirspyDriver {
    fn device(&self) -> &Device {
        &self.device
    }

    fn device_path(&self) -> String {
        format!("airspy:{}", self.socket_path.display())
    }

    fn upstream(&self) -> Upstream {
        Upstream::Vah
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn init(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionRequest::Init { reply }).await?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    async fn set_param(&self, setting: ParamSetting) -> Result<()> {
        let frame = self.encode(&setting)?;
        debug!(port = self.device.port, param = %setting.name, value = setting.value, "set parameter");
        self.send(SessionRequest::Command {
            frame: frame.to_vec(),
            handler: None,
        })
        .await
    }

    async fn start_stop(&self, on: bool) -> Result<()> {
        info!(port = self.device.port, on, "airspy streaming");
        self.set_param(ParamSetting::new("streaming", if on { 1.0 } else { 0.0 }))
            .await
    }

    async fn stalled(&self, reason: &str) -> Result<()> {
        self.send(SessionRequest::Stalled {
            reason: reason.to_string(),
        })
        .await
    }

    async fn teardown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.send(SessionRequest::Teardown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}
