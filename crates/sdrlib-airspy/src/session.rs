//! The per-device session task.
//!
//! One tokio task owns everything a device session has: the `airspy_tcp`
//! process, the command channel, the reply decoder, and the command queue.
//! The [`AirspyDriver`](crate::AirspyDriver) handle talks to it over an mpsc
//! channel, so no session state is ever touched from two places at once.
//!
//! The task uses `tokio::select! { biased; }` to prioritize:
//! 1. Requests from the driver handle
//! 2. Process output and exit
//! 3. Replies on the command channel
//! 4. The command channel's reconnect deadline

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use sdrlib_core::error::{Error, Result};
use sdrlib_core::events::{EventBus, StationEvent};
use sdrlib_core::state::SessionState;
use sdrlib_core::transport::ChannelKind;
use sdrlib_core::types::{Device, Settings};
use sdrlib_text_io::{Correlator, Dispatch, LineDecoder, Record, ReplyHandler, ReplyPolicy};
use sdrlib_transport::{
    ChannelManager, ConnectOutcome, ProcessSpec, ProcessSupervisor, SupervisorEvent, wait_until,
};

use crate::builder::{AirspyConfig, ready_marker};
use crate::commands::usb_buffer_size;

/// Read buffer for the command channel. Settings replies are a few hundred
/// bytes.
const READ_BUF: usize = 4096;

/// A request sent from the driver handle to the session task.
pub(crate) enum SessionRequest {
    /// Resolve once the command channel has been usable at least once.
    Init { reply: oneshot::Sender<Result<()>> },
    /// One encoded 5-byte command.
    Command {
        frame: Vec<u8>,
        handler: Option<ReplyHandler>,
    },
    /// Data stopped flowing; kill the server and ask for a restart.
    Stalled { reason: String },
    /// Release everything and stop the task.
    Teardown { reply: oneshot::Sender<()> },
}

/// What woke the loop.
enum Step {
    Request(Option<SessionRequest>),
    Process(SupervisorEvent),
    Read(Result<usize>),
    Reconnect,
}

/// Launch arguments for `airspy_tcp`.
pub(crate) fn process_spec(config: &AirspyConfig, device: &Device) -> ProcessSpec {
    let socket = config.socket_path(device);
    let mut spec = ProcessSpec::new(&config.program)
        .arg("-p")
        .arg(socket.display().to_string());
    match &device.serial {
        Some(serial) => spec = spec.arg("-S").arg(serial.as_str()),
        None => warn!(port = device.port, "no serial number; server will pick a device"),
    }
    let bufsize = usb_buffer_size(config.hardware_rate, config.buffered, config.usb_alignment);
    spec.arg("-s")
        .arg(config.hardware_rate.to_string())
        .arg("-B")
        .arg(bufsize.to_string())
}

pub(crate) struct Session {
    device: Device,
    config: AirspyConfig,
    bus: EventBus,
    supervisor: ProcessSupervisor,
    cmd: ChannelManager,
    decoder: LineDecoder,
    correlator: Correlator,
    state: watch::Sender<SessionState>,
    init_waiters: Vec<oneshot::Sender<Result<()>>>,
    initialized: bool,
    restart_requested: bool,
}

impl Session {
    pub(crate) fn new(
        config: AirspyConfig,
        device: Device,
        bus: EventBus,
        state: watch::Sender<SessionState>,
    ) -> Self {
        let socket = config.socket_path(&device);
        let supervisor = ProcessSupervisor::new(process_spec(&config, &device), ready_marker(&config))
            .with_socket(&socket);
        let cmd = ChannelManager::new(&socket, ChannelKind::Command, config.reconnect_delay)
            .with_connect_timeout(config.connect_timeout);
        Session {
            decoder: LineDecoder::with_header(config.header_len),
            correlator: Correlator::new(ReplyPolicy::EveryCommand),
            device,
            config,
            bus,
            supervisor,
            cmd,
            state,
            init_waiters: Vec::new(),
            initialized: false,
            restart_requested: false,
        }
    }

    pub(crate) async fn run(mut self, mut requests: mpsc::Receiver<SessionRequest>) {
        self.start();
        let mut buf = vec![0u8; READ_BUF];

        loop {
            let reconnect_at = self.cmd.reconnect_at();
            let step = tokio::select! {
                biased;

                req = requests.recv() => Step::Request(req),
                event = self.supervisor.next_event() => Step::Process(event),
                read = self.cmd.recv(&mut buf) => Step::Read(read),
                _ = wait_until(reconnect_at) => Step::Reconnect,
            };

            match step {
                Step::Request(Some(req)) => {
                    if !self.handle_request(req).await {
                        return;
                    }
                }
                Step::Request(None) => {
                    debug!(port = self.device.port, "driver handle dropped, tearing down");
                    self.teardown().await;
                    return;
                }
                Step::Process(event) => self.on_process_event(event).await,
                Step::Read(Ok(n)) => self.on_bytes(&buf[..n]),
                Step::Read(Err(e)) => self.on_channel_lost(e),
                Step::Reconnect => self.on_reconnect_due().await,
            }
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, next: SessionState) {
        let current = self.state();
        match current.transition(next) {
            Ok(next) => {
                debug!(port = self.device.port, from = %current, to = %next, "session state");
                self.state.send_replace(next);
            }
            Err(e) => warn!(port = self.device.port, error = %e, "ignoring state change"),
        }
    }

    fn start(&mut self) {
        self.set_state(SessionState::Spawning);
        match self.supervisor.spawn() {
            Ok(()) => {
                info!(
                    port = self.device.port,
                    pid = ?self.supervisor.pid(),
                    socket = %self.cmd.path().display(),
                    "airspy server launched"
                );
                self.set_state(SessionState::AwaitingReady);
            }
            Err(e) => {
                self.bus.publish(StationEvent::DeviceError {
                    port: Some(self.device.port),
                    message: format!("failed to launch airspy server: {e}"),
                });
                self.request_restart(format!("launch failed: {e}"));
            }
        }
    }

    /// Returns `false` once the session has been torn down.
    async fn handle_request(&mut self, req: SessionRequest) -> bool {
        match req {
            SessionRequest::Init { reply } => {
                if self.initialized {
                    let _ = reply.send(Ok(()));
                } else {
                    self.init_waiters.push(reply);
                }
            }
            SessionRequest::Command { frame, handler } => {
                if self.correlator.submit(ChannelKind::Command, vec![frame], handler).is_ok() {
                    self.flush().await;
                }
            }
            SessionRequest::Stalled { reason } => self.on_stalled(reason).await,
            SessionRequest::Teardown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn on_process_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Ready => {
                self.set_state(SessionState::ConnectingChannels);
                self.connect_command().await;
            }
            SupervisorEvent::Output(line) => {
                debug!(port = self.device.port, line = %line, "airspy server output");
            }
            SupervisorEvent::Exited { outcome, decision } => {
                self.cmd.disconnect().await;
                self.correlator.on_disconnect();
                if decision.report_error {
                    self.bus.publish(StationEvent::DeviceError {
                        port: Some(self.device.port),
                        message: format!("airspy server died, {outcome}"),
                    });
                }
                if decision.restart {
                    self.request_restart(format!("airspy server exited with {outcome}"));
                }
            }
        }
    }

    async fn connect_command(&mut self) {
        match self.cmd.connect().await {
            Ok(ConnectOutcome::Connected) => self.on_connected().await,
            Ok(ConnectOutcome::AlreadyConnected) => {}
            Err(e) => warn!(
                port = self.device.port,
                error = %e,
                delay_ms = self.config.reconnect_delay.as_millis(),
                "command connect failed, will retry"
            ),
        }
    }

    async fn on_connected(&mut self) {
        info!(port = self.device.port, path = %self.cmd.path().display(), "command channel connected");
        self.decoder.reset();
        self.set_state(SessionState::Streaming);
        self.flush().await;
        if !self.initialized {
            self.initialized = true;
            for waiter in self.init_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    /// Write queued commands while the channel is up.
    async fn flush(&mut self) {
        while self.cmd.is_connected() {
            let Some(bytes) = self.correlator.take_outgoing() else {
                break;
            };
            if let Err(e) = self.cmd.send(&bytes).await {
                self.on_channel_lost(e);
                break;
            }
        }
    }

    fn on_bytes(&mut self, data: &[u8]) {
        for record in self.decoder.push_records(data) {
            match record {
                Record::Reply(value) => self.on_reply(value),
                Record::Event { event, .. } => {
                    debug!(port = self.device.port, event = %event, "ignoring async record")
                }
            }
        }
    }

    fn on_reply(&mut self, value: Value) {
        let reply = match serde_json::from_value::<Settings>(value) {
            Ok(native) => {
                let settings = self.config.table.report_to_natural(&native);
                self.bus.publish(StationEvent::Settings {
                    port: self.device.port,
                    settings: settings.clone(),
                });
                Value::Object(settings.into_iter().collect())
            }
            Err(e) => {
                warn!(port = self.device.port, error = %e, "settings reply is not an object");
                Value::Null
            }
        };
        match self.correlator.on_reply(reply) {
            Dispatch::Unmatched(_) => debug!(port = self.device.port, "unsolicited settings reply"),
            Dispatch::Owned { tag, .. } => debug!(port = self.device.port, tag, "owned reply"),
            Dispatch::Delivered | Dispatch::Partial | Dispatch::Unhandled(_) => {}
        }
    }

    fn on_channel_lost(&mut self, e: Error) {
        warn!(port = self.device.port, error = %e, "command channel lost");
        self.correlator.on_disconnect();
        if self.state() == SessionState::Streaming {
            self.set_state(SessionState::ConnectingChannels);
        }
    }

    async fn on_reconnect_due(&mut self) {
        if self.supervisor.is_ready() {
            self.connect_command().await;
        } else {
            // The server is gone or not listening yet; readiness will connect.
            self.cmd.disconnect().await;
        }
    }

    async fn on_stalled(&mut self, reason: String) {
        if self.restart_requested {
            debug!(port = self.device.port, "restart already requested");
            return;
        }
        info!(port = self.device.port, reason = %reason, "device stalled, restarting");
        if self.state().can_transition_to(SessionState::Stalling) {
            self.set_state(SessionState::Stalling);
        }
        self.cmd.disconnect().await;
        self.correlator.on_disconnect();
        if self.supervisor.is_running() {
            // The exit arrives as a process event and requests the restart.
            self.supervisor.kill(true);
            self.set_state(SessionState::Restarting);
        } else {
            self.request_restart(reason);
        }
    }

    /// Ask the station to remove and re-add this device. Sent at most once
    /// per session.
    fn request_restart(&mut self, reason: String) {
        if self.state() != SessionState::Restarting {
            self.set_state(SessionState::Restarting);
        }
        if self.restart_requested {
            return;
        }
        self.restart_requested = true;
        self.bus.publish(StationEvent::RestartRequested {
            device: self.device.clone(),
            reason,
        });
    }

    async fn teardown(&mut self) {
        debug!(port = self.device.port, "session teardown");
        self.supervisor.shutdown().await;
        self.cmd.shutdown().await;
        self.correlator.close();
        for waiter in self.init_waiters.drain(..) {
            let _ = waiter.send(Err(Error::Terminated));
        }
        self.set_state(SessionState::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdrlib_core::DriverKind;
    use std::time::Duration;

    #[test]
    fn launch_arguments() {
        let config = AirspyConfig::default();
        let device = Device::new("1:4", 2, DriverKind::Airspy).with_serial("a74068c82f4e3c53");
        let spec = process_spec(&config, &device);
        assert_eq!(spec.name, "airspy_tcp");
        assert_eq!(
            spec.args,
            vec![
                "-p",
                "/tmp/airspy-1:4.sock",
                "-S",
                "a74068c82f4e3c53",
                "-s",
                "6000000",
                "-B",
                "48128"
            ]
        );
    }

    #[test]
    fn launch_arguments_without_serial() {
        let config = AirspyConfig {
            buffered: Duration::from_millis(16),
            ..AirspyConfig::default()
        };
        let device = Device::new("3:1", 4, DriverKind::Airspy);
        let spec = process_spec(&config, &device);
        assert!(!spec.args.contains(&"-S".to_string()));
        assert_eq!(spec.args.last().map(String::as_str), Some("96256"));
    }
}
