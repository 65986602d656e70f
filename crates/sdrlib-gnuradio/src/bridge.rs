//! The shared bridge task.
//!
//! One tokio task owns the bridge process, its command and data channels,
//! the command queue, and the rate monitor. Every device served by the
//! bridge talks to it through a cloned [`BridgeHandle`].
//!
//! The bridge answers only commands that were submitted with a handler
//! (`list`, mostly), so its correlator runs under
//! [`ReplyPolicy::WhenHandled`]. Records flagged `async` are notifications
//! and never consume a reply slot.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use sdrlib_core::error::{Error, Result};
use sdrlib_core::events::{EventBus, StationEvent, Upstream};
use sdrlib_core::health::{HealthEvent, HealthMonitor, HealthReport};
use sdrlib_core::state::SessionState;
use sdrlib_core::transport::ChannelKind;
use sdrlib_text_io::{Correlator, Dispatch, LineDecoder, Record, ReplyHandler, ReplyPolicy};
use sdrlib_transport::{
    ChannelManager, ConnectOutcome, ProcessSpec, ProcessSupervisor, ReadyMarker, SupervisorEvent,
    wait_until,
};

use crate::builder::BridgeConfig;
use crate::raw::RawStream;

const READ_BUF: usize = 8192;

/// Source name used for data lines published as [`StationEvent::RawLine`].
pub const DATA_SOURCE: &str = "gnuradio";

/// Async event name the bridge uses to report a stalled port.
const STALL_EVENT: &str = "devStalled";

pub(crate) enum BridgeRequest {
    Submit {
        channel: ChannelKind,
        lines: Vec<String>,
        handler: Option<ReplyHandler>,
        reply: oneshot::Sender<Result<()>>,
    },
    Accept {
        label: String,
    },
    Forget {
        label: String,
    },
    Quit {
        reply: oneshot::Sender<()>,
    },
}

/// A `list` written to the bridge and not yet answered.
#[derive(Debug, Clone, Copy)]
struct PendingList {
    tag: u64,
    sent: Instant,
}

enum Step {
    Request(Option<BridgeRequest>),
    Process(SupervisorEvent),
    Command(Result<usize>),
    Data(Result<usize>),
    Reconnect(ChannelKind),
    Respawn,
    CheckRates,
}

/// Handle to the bridge task. Clones share the same bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    config: Arc<BridgeConfig>,
    requests: mpsc::Sender<BridgeRequest>,
    state: watch::Receiver<SessionState>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BridgeHandle {
    pub(crate) fn start(config: BridgeConfig, bus: EventBus) -> Self {
        let (requests, rx) = mpsc::channel(64);
        let (state_tx, state) = watch::channel(SessionState::Idle);
        let bridge = Bridge::new(config.clone(), bus, state_tx);
        let task = tokio::spawn(bridge.run(rx));
        BridgeHandle {
            config: Arc::new(config),
            requests,
            state,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_path()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Queue text commands for the bridge, one line each without the
    /// terminator.
    ///
    /// Fails with [`Error::WrongChannel`] for the data channel. With a
    /// handler, the bridge's replies are routed to it: bare for a single
    /// command, as a `Vec` for several.
    pub async fn submit(
        &self,
        channel: ChannelKind,
        lines: Vec<String>,
        handler: Option<ReplyHandler>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(BridgeRequest::Submit {
            channel,
            lines,
            handler,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    /// Send one command and wait for its reply.
    pub async fn command(&self, line: impl Into<String>) -> Result<Value> {
        let (handler, rx) = ReplyHandler::single();
        self.submit(ChannelKind::Command, vec![line.into()], Some(handler))
            .await?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    /// Send several commands and wait for all their replies, in order.
    pub async fn command_batch(&self, lines: Vec<String>) -> Result<Vec<Value>> {
        let (handler, rx) = ReplyHandler::batch();
        self.submit(ChannelKind::Command, lines, Some(handler)).await?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    /// Start or stop the flow graph for `port`. Stopping also ends rate
    /// monitoring for the port.
    pub async fn start_stop(&self, on: bool, port: u32) -> Result<()> {
        let verb = if on { "start" } else { "stop" };
        self.submit(ChannelKind::Command, vec![format!("{verb} {port}")], None)
            .await?;
        if !on {
            self.forget(&format!("p{port}")).await?;
        }
        Ok(())
    }

    /// Ask the bridge to send data for `label` and start monitoring its rate.
    pub async fn accept(&self, label: &str) -> Result<()> {
        self.send(BridgeRequest::Accept {
            label: label.to_string(),
        })
        .await
    }

    /// Stop monitoring `label`.
    pub async fn forget(&self, label: &str) -> Result<()> {
        self.send(BridgeRequest::Forget {
            label: label.to_string(),
        })
        .await
    }

    /// Open an extra connection that carries raw output for `label`.
    pub async fn open_raw_stream(&self, label: &str, rate: u32, fm: bool) -> Result<RawStream> {
        RawStream::open(
            self.socket_path(),
            label,
            rate,
            fm,
            self.config.connect_timeout,
        )
        .await
    }

    /// Kill the bridge and stop the task for good.
    pub async fn quit(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.send(BridgeRequest::Quit { reply }).await.is_ok() {
            let _ = rx.await;
        }
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    async fn send(&self, req: BridgeRequest) -> Result<()> {
        self.requests.send(req).await.map_err(|_| Error::Terminated)
    }
}

struct Bridge {
    config: BridgeConfig,
    bus: EventBus,
    supervisor: ProcessSupervisor,
    cmd: ChannelManager,
    data: ChannelManager,
    cmd_decoder: LineDecoder,
    data_decoder: LineDecoder,
    correlator: Correlator,
    health: HealthMonitor,
    health_tick: Interval,
    next_tag: u64,
    list_pending: Option<PendingList>,
    accepted: BTreeSet<String>,
    state: watch::Sender<SessionState>,
}

impl Bridge {
    fn new(config: BridgeConfig, bus: EventBus, state: watch::Sender<SessionState>) -> Self {
        let socket = config.socket_path();
        let spec = ProcessSpec::new(&config.program).args(["-s", config.socket_name.as_str()]);
        let supervisor = ProcessSupervisor::new(spec, ReadyMarker::AnyOutput).with_socket(&socket);
        let cmd = ChannelManager::new(&socket, ChannelKind::Command, config.reconnect_delay)
            .with_connect_timeout(config.connect_timeout);
        let data = ChannelManager::new(&socket, ChannelKind::Data, config.reconnect_delay)
            .with_connect_timeout(config.connect_timeout);

        let period = config.health.interval;
        let mut health_tick = tokio::time::interval_at(Instant::now() + period, period);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Bridge {
            health: HealthMonitor::new(config.health.clone()),
            config,
            bus,
            supervisor,
            cmd,
            data,
            cmd_decoder: LineDecoder::new(),
            data_decoder: LineDecoder::new(),
            correlator: Correlator::new(ReplyPolicy::WhenHandled),
            health_tick,
            next_tag: 0,
            list_pending: None,
            accepted: BTreeSet::new(),
            state,
        }
    }

    async fn run(mut self, mut requests: mpsc::Receiver<BridgeRequest>) {
        if self.config.reap_stale {
            reap_stale(&self.supervisor.spec().name).await;
        }
        self.spawn();

        let mut cmd_buf = vec![0u8; READ_BUF];
        let mut data_buf = vec![0u8; READ_BUF];

        loop {
            let cmd_reconnect = self.cmd.reconnect_at();
            let data_reconnect = self.data.reconnect_at();
            let respawn = self.supervisor.restart_at();

            let step = tokio::select! {
                biased;

                req = requests.recv() => Step::Request(req),
                event = self.supervisor.next_event() => Step::Process(event),
                read = self.cmd.recv(&mut cmd_buf) => Step::Command(read),
                read = self.data.recv(&mut data_buf) => Step::Data(read),
                _ = wait_until(cmd_reconnect) => Step::Reconnect(ChannelKind::Command),
                _ = wait_until(data_reconnect) => Step::Reconnect(ChannelKind::Data),
                _ = wait_until(respawn) => Step::Respawn,
                _ = self.health_tick.tick() => Step::CheckRates,
            };

            match step {
                Step::Request(Some(req)) => {
                    if !self.handle_request(req).await {
                        return;
                    }
                }
                Step::Request(None) => {
                    debug!("all bridge handles dropped, quitting");
                    self.quit().await;
                    return;
                }
                Step::Process(event) => self.on_process_event(event).await,
                Step::Command(Ok(n)) => self.on_command_bytes(&cmd_buf[..n]),
                Step::Command(Err(e)) => self.on_lost(ChannelKind::Command, e),
                Step::Data(Ok(n)) => self.on_data_bytes(&data_buf[..n]),
                Step::Data(Err(e)) => self.on_lost(ChannelKind::Data, e),
                Step::Reconnect(kind) => self.on_reconnect_due(kind).await,
                Step::Respawn => self.spawn(),
                Step::CheckRates => self.check_rates().await,
            }
        }
    }

    fn set_state(&mut self, next: SessionState) {
        let current = *self.state.borrow();
        if current == next {
            return;
        }
        match current.transition(next) {
            Ok(next) => {
                debug!(from = %current, to = %next, "bridge state");
                self.state.send_replace(next);
            }
            Err(e) => warn!(error = %e, "ignoring bridge state change"),
        }
    }

    fn channel(&mut self, kind: ChannelKind) -> &mut ChannelManager {
        match kind {
            ChannelKind::Command => &mut self.cmd,
            ChannelKind::Data => &mut self.data,
        }
    }

    fn spawn(&mut self) {
        self.set_state(SessionState::Spawning);
        match self.supervisor.spawn() {
            Ok(()) => {
                info!(
                    pid = ?self.supervisor.pid(),
                    socket = %self.cmd.path().display(),
                    "gnuradio bridge launched"
                );
                self.set_state(SessionState::AwaitingReady);
            }
            Err(e) => {
                self.bus.publish(StationEvent::DeviceError {
                    port: None,
                    message: format!("failed to launch gnuradio bridge: {e}"),
                });
                self.supervisor.schedule_restart(self.config.respawn_delay);
                self.set_state(SessionState::Restarting);
            }
        }
    }

    /// Returns `false` once the bridge has quit.
    async fn handle_request(&mut self, req: BridgeRequest) -> bool {
        match req {
            BridgeRequest::Submit {
                channel,
                lines,
                handler,
                reply,
            } => {
                for line in lines.iter().filter(|l| l.as_str() != "list") {
                    info!(command = %line, "gnuradio command");
                }
                let frames = lines
                    .into_iter()
                    .map(|l| format!("{l}\n").into_bytes())
                    .collect();
                let result = self.correlator.submit(channel, frames, handler);
                if result.is_ok() {
                    self.flush().await;
                }
                let _ = reply.send(result);
            }
            BridgeRequest::Accept { label } => {
                self.health.accept(&label, Instant::now());
                self.accepted.insert(label.clone());
                if self.data.is_connected() {
                    self.send_receive(&label).await;
                }
            }
            BridgeRequest::Forget { label } => {
                self.accepted.remove(&label);
                if self.health.forget(&label) {
                    debug!(label = %label, "stopped monitoring");
                }
            }
            BridgeRequest::Quit { reply } => {
                self.quit().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn send_receive(&mut self, label: &str) {
        info!(label = %label, "asking bridge to receive");
        let line = format!("receive {label}\n");
        if let Err(e) = self.data.send(line.as_bytes()).await {
            self.on_lost(ChannelKind::Data, e);
        }
    }

    async fn on_process_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Ready => {
                self.set_state(SessionState::ConnectingChannels);
                self.bus.publish(StationEvent::BridgeStarted);
                self.connect(ChannelKind::Command).await;
                self.connect(ChannelKind::Data).await;
            }
            SupervisorEvent::Output(line) => debug!(line = %line, "bridge output"),
            SupervisorEvent::Exited { outcome, decision } => {
                self.cmd.disconnect().await;
                self.data.disconnect().await;
                self.correlator.on_disconnect();
                self.list_pending = None;
                self.health.clear();
                self.accepted.clear();
                if decision.report_error {
                    self.bus.publish(StationEvent::DeviceError {
                        port: None,
                        message: format!("gnuradio bridge died, {outcome}"),
                    });
                }
                self.bus.publish(StationEvent::UpstreamDied {
                    upstream: Upstream::Bridge,
                });
                if decision.restart {
                    self.supervisor.schedule_restart(self.config.respawn_delay);
                }
                self.set_state(SessionState::Restarting);
            }
        }
    }

    async fn connect(&mut self, kind: ChannelKind) {
        let delay_ms = self.config.reconnect_delay.as_millis();
        match self.channel(kind).connect().await {
            Ok(ConnectOutcome::Connected) => self.on_connected(kind).await,
            Ok(ConnectOutcome::AlreadyConnected) => {}
            Err(e) => warn!(kind = %kind, error = %e, delay_ms, "bridge connect failed, will retry"),
        }
    }

    async fn on_connected(&mut self, kind: ChannelKind) {
        info!(kind = %kind, path = %self.cmd.path().display(), "bridge channel connected");
        match kind {
            ChannelKind::Command => {
                self.cmd_decoder.reset();
                self.flush().await;
            }
            ChannelKind::Data => {
                self.data_decoder.reset();
                let labels: Vec<String> = self.accepted.iter().cloned().collect();
                for label in labels {
                    self.send_receive(&label).await;
                }
            }
        }
        if self.cmd.is_connected() && self.data.is_connected() {
            self.set_state(SessionState::Streaming);
        }
    }

    async fn flush(&mut self) {
        while self.cmd.is_connected() {
            let Some(bytes) = self.correlator.take_outgoing() else {
                break;
            };
            if let Err(e) = self.cmd.send(&bytes).await {
                self.on_lost(ChannelKind::Command, e);
                break;
            }
        }
    }

    fn on_lost(&mut self, kind: ChannelKind, e: Error) {
        warn!(kind = %kind, error = %e, "bridge channel lost");
        if kind == ChannelKind::Command {
            self.correlator.on_disconnect();
            self.list_pending = None;
        }
        if *self.state.borrow() == SessionState::Streaming {
            self.set_state(SessionState::ConnectingChannels);
        }
    }

    async fn on_reconnect_due(&mut self, kind: ChannelKind) {
        if self.supervisor.is_ready() {
            self.connect(kind).await;
        } else {
            self.channel(kind).disconnect().await;
        }
    }

    fn on_command_bytes(&mut self, data: &[u8]) {
        for record in self.cmd_decoder.push_records(data) {
            match record {
                Record::Event { event, label, body } => self.on_notification(event, label, body),
                Record::Reply(value) => match self.correlator.on_reply(value) {
                    Dispatch::Owned { tag, replies } => self.on_owned_reply(tag, replies),
                    Dispatch::Unmatched(value) => {
                        debug!(reply = %value, "bridge reply with no handler")
                    }
                    Dispatch::Delivered | Dispatch::Partial | Dispatch::Unhandled(_) => {}
                },
            }
        }
    }

    fn on_notification(&mut self, event: String, label: Option<String>, body: Value) {
        info!(event = %event, label = ?label, "gnuradio async");
        if event == STALL_EVENT {
            if let Some(label) = &label {
                let reason = body
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("bridge reported a stall")
                    .to_string();
                self.bus.publish(StationEvent::DeviceStalled {
                    label: label.clone(),
                    reason,
                });
            }
        }
        self.bus.publish(StationEvent::BridgeNotification {
            event,
            label,
            payload: body,
        });
    }

    fn on_data_bytes(&mut self, data: &[u8]) {
        for line in self.data_decoder.push(data) {
            self.bus.publish(StationEvent::RawLine {
                source: DATA_SOURCE.to_string(),
                line,
            });
        }
    }

    async fn check_rates(&mut self) {
        if !self.cmd.is_connected() {
            return;
        }
        // The previous `list` was sent one tick ago; its reply is lost.
        if let Some(pending) = self.list_pending.take() {
            warn!(
                tag = pending.tag,
                waited_ms = pending.sent.elapsed().as_millis() as u64,
                "no status reply from bridge, asking again"
            );
            self.correlator.abandon(pending.tag);
        }
        if self.health.labels().is_empty() {
            return;
        }
        self.next_tag += 1;
        let tag = self.next_tag;
        let submitted = self.correlator.submit(
            ChannelKind::Command,
            vec![b"list\n".to_vec()],
            Some(ReplyHandler::Owned(tag)),
        );
        if submitted.is_ok() {
            self.list_pending = Some(PendingList {
                tag,
                sent: Instant::now(),
            });
            self.flush().await;
        }
    }

    fn on_owned_reply(&mut self, tag: u64, replies: Vec<Value>) {
        if self.list_pending.map(|p| p.tag) != Some(tag) {
            debug!(tag, "stale status reply");
            return;
        }
        self.list_pending = None;
        let Some(reply) = replies.first() else {
            return;
        };
        let report = HealthReport::from_value(reply);
        for event in self.health.check(&report, Instant::now()) {
            let event = match event {
                HealthEvent::Frames { label, frames } => StationEvent::FrameCount { label, frames },
                HealthEvent::Rate { label, rate } => StationEvent::FrameRate { label, rate },
                HealthEvent::Stalled { label, reason } => {
                    StationEvent::DeviceStalled { label, reason }
                }
            };
            self.bus.publish(event);
        }
    }

    async fn quit(&mut self) {
        debug!("bridge quitting");
        self.supervisor.shutdown().await;
        self.cmd.shutdown().await;
        self.data.shutdown().await;
        self.correlator.close();
        self.health.clear();
        self.accepted.clear();
        self.set_state(SessionState::Terminated);
    }
}

/// Kill bridge processes left over from an earlier run.
async fn reap_stale(name: &str) {
    let status = tokio::process::Command::new("killall")
        .args(["-KILL", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) => debug!(name, %status, "reaped stale bridge processes"),
        Err(e) => warn!(name, error = %e, "could not run killall"),
    }
}
