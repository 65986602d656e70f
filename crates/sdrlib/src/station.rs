//! The station registry.
//!
//! [`Station`] owns one driver session per attached device and reacts to the
//! control events on the station bus: devices being added and removed,
//! sessions asking for a restart, streams stalling, upstream consumers
//! dying, and the final `Quit`. It reads them from the bus's lossless
//! control lane, never from the broadcast side that carries telemetry.
//!
//! A restart is a remove followed by a delayed re-add. The old session is
//! torn down, and its process reaped, before the `DeviceRemoved` event goes
//! out, so two processes never serve the same device at once.

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, info, warn};

use sdrlib_core::driver::{DeviceDriver, DriverFactory};
use sdrlib_core::events::{DEFAULT_BUS_CAPACITY, EventBus, StationEvent, Upstream};
use sdrlib_core::state::SessionState;
use sdrlib_core::types::{Device, PlanSource, SerialLookup, Settings};

/// Station-wide settings.
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Delay between tearing a session down and re-adding its device.
    pub readd_delay: Duration,
    /// Events buffered per bus subscriber.
    pub bus_capacity: usize,
}

impl Default for StationConfig {
    fn default() -> Self {
        StationConfig {
            readd_delay: Duration::from_millis(5000),
            bus_capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

impl StationConfig {
    /// A bus sized for this configuration.
    pub fn bus(&self) -> EventBus {
        EventBus::new(self.bus_capacity)
    }
}

/// Snapshot of one registered device.
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub device: Device,
    pub state: SessionState,
    pub device_path: String,
}

enum Query {
    Devices { reply: oneshot::Sender<Vec<DeviceStatus>> },
}

/// Handle to the running station task.
pub struct Station {
    bus: EventBus,
    queries: mpsc::Sender<Query>,
    task: JoinHandle<()>,
}

impl Station {
    /// Start the registry on `bus`.
    ///
    /// Must be called from within a tokio runtime. The station takes the
    /// bus's control lane before returning, so no control event published
    /// afterwards is missed. Run at most one station per bus.
    pub fn start(
        config: StationConfig,
        plans: Arc<dyn PlanSource>,
        serials: Arc<dyn SerialLookup>,
        factory: Arc<dyn DriverFactory>,
        bus: EventBus,
    ) -> Self {
        let (queries, rx) = mpsc::channel(8);
        let registry = Registry {
            config,
            plans,
            serials,
            factory,
            control: bus.control_events(),
            bus: bus.clone(),
            sessions: HashMap::new(),
            readds: DelayQueue::new(),
            readd_keys: HashMap::new(),
            own_removals: HashMap::new(),
        };
        let task = tokio::spawn(registry.run(rx));
        Station {
            bus,
            queries,
            task,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Announce a new device.
    pub fn add_device(&self, device: Device) {
        self.bus.publish(StationEvent::DeviceAdded { device });
    }

    /// Announce that a device went away.
    pub fn remove_device(&self, device: Device) {
        self.bus.publish(StationEvent::DeviceRemoved { device });
    }

    /// Registered devices, sorted by port.
    pub async fn devices(&self) -> Vec<DeviceStatus> {
        let (reply, rx) = oneshot::channel();
        if self.queries.send(Query::Devices { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Shut down every session and the station itself.
    pub async fn quit(self) {
        self.bus.publish(StationEvent::Quit);
        if let Err(e) = self.task.await {
            warn!(error = %e, "station task failed");
        }
    }
}

struct Session {
    device: Device,
    driver: Arc<dyn DeviceDriver>,
    /// Applies the plan after creation.
    setup: JoinHandle<()>,
}

enum Step {
    Event(Option<StationEvent>),
    Query(Option<Query>),
    Readd(Device),
}

struct Registry {
    config: StationConfig,
    plans: Arc<dyn PlanSource>,
    serials: Arc<dyn SerialLookup>,
    factory: Arc<dyn DriverFactory>,
    bus: EventBus,
    control: mpsc::UnboundedReceiver<StationEvent>,
    /// Keyed by USB path.
    sessions: HashMap<String, Session>,
    readds: DelayQueue<Device>,
    readd_keys: HashMap<String, delay_queue::Key>,
    /// `DeviceRemoved` events this station published itself for a restart
    /// and has not seen come back yet.
    own_removals: HashMap<String, u32>,
}

impl Registry {
    async fn run(mut self, mut queries: mpsc::Receiver<Query>) {
        loop {
            let step = tokio::select! {
                biased;

                event = self.control.recv() => Step::Event(event),
                query = queries.recv() => Step::Query(query),
                Some(expired) = poll_fn(|cx| self.readds.poll_expired(cx)),
                    if !self.readds.is_empty() => Step::Readd(expired.into_inner()),
            };

            match step {
                Step::Event(Some(StationEvent::Quit)) => {
                    self.quit().await;
                    return;
                }
                Step::Event(Some(event)) => self.on_event(event).await,
                Step::Event(None) => {
                    warn!("control lane taken by another station, stopping");
                    return;
                }
                Step::Query(Some(Query::Devices { reply })) => {
                    let _ = reply.send(self.snapshot());
                }
                Step::Query(None) => {}
                Step::Readd(device) => {
                    self.readd_keys.remove(&device.usb_path);
                    info!(%device, "re-adding device");
                    self.bus.publish(StationEvent::DeviceAdded { device });
                }
            }
        }
    }

    async fn on_event(&mut self, event: StationEvent) {
        match event {
            StationEvent::DeviceAdded { device } => self.add(device).await,
            StationEvent::DeviceRemoved { device } => self.on_removed(device).await,
            StationEvent::RestartRequested { device, reason } => {
                self.restart(device, &reason).await
            }
            StationEvent::DeviceStalled { label, reason } => {
                let driver = self
                    .sessions
                    .values()
                    .find(|s| s.device.label() == label)
                    .map(|s| s.driver.clone());
                match driver {
                    Some(driver) => self.stall(driver, &reason).await,
                    None => debug!(label = %label, "stall for an unknown port"),
                }
            }
            StationEvent::UpstreamDied { upstream } => self.on_upstream_died(upstream).await,
            StationEvent::Settings { port, settings } => self.update_settings(port, settings),
            _ => {}
        }
    }

    async fn add(&mut self, mut device: Device) {
        if let Some(key) = self.readd_keys.remove(&device.usb_path) {
            self.readds.remove(&key);
        }
        let Some(plan) = self.plans.plan_for(&device) else {
            info!(%device, "no plan for device, ignoring");
            return;
        };
        self.remove_session(&device.usb_path).await;

        if device.serial.is_none() {
            device.serial = self.serials.serial_for(&device.usb_path);
        }

        let driver: Arc<dyn DeviceDriver> =
            match self
                .factory
                .create(device.clone(), plan.clone(), self.bus.clone())
            {
                Ok(driver) => Arc::from(driver),
                Err(e) => {
                    warn!(%device, error = %e, "could not create session");
                    self.bus.publish(StationEvent::DeviceError {
                        port: Some(device.port),
                        message: format!("could not create session: {e}"),
                    });
                    return;
                }
            };
        info!(%device, path = %driver.device_path(), "device added");

        let setup = tokio::spawn({
            let driver = driver.clone();
            let settings = plan.settings();
            async move {
                if let Err(e) = driver.init().await {
                    debug!(port = driver.device().port, error = %e, "session ended before init");
                    return;
                }
                for setting in settings {
                    if let Err(e) = driver.set_param(setting).await {
                        warn!(port = driver.device().port, error = %e, "plan parameter not applied");
                    }
                }
                if let Err(e) = driver.start_stop(true).await {
                    warn!(port = driver.device().port, error = %e, "could not start streaming");
                }
            }
        });

        self.sessions.insert(
            device.usb_path.clone(),
            Session {
                device,
                driver,
                setup,
            },
        );
    }

    async fn on_removed(&mut self, device: Device) {
        if let Some(count) = self.own_removals.get_mut(&device.usb_path) {
            *count -= 1;
            if *count == 0 {
                self.own_removals.remove(&device.usb_path);
            }
            return;
        }
        if let Some(key) = self.readd_keys.remove(&device.usb_path) {
            self.readds.remove(&key);
            debug!(%device, "pending re-add cancelled");
        }
        if self.remove_session(&device.usb_path).await {
            info!(%device, "device removed");
        }
    }

    /// Tear down the session for `usb_path`, if any.
    async fn remove_session(&mut self, usb_path: &str) -> bool {
        let Some(session) = self.sessions.remove(usb_path) else {
            return false;
        };
        session.setup.abort();
        if let Err(e) = session.driver.teardown().await {
            warn!(device = %session.device, error = %e, "teardown failed");
        }
        true
    }

    async fn restart(&mut self, device: Device, reason: &str) {
        let Some(session) = self.sessions.get(&device.usb_path) else {
            debug!(%device, "restart for an unregistered device");
            return;
        };
        // Re-add with the registry's copy so the latest settings and serial
        // carry over.
        let device = session.device.clone();
        info!(%device, reason, delay_ms = self.config.readd_delay.as_millis(), "restarting device");

        self.remove_session(&device.usb_path).await;
        *self.own_removals.entry(device.usb_path.clone()).or_insert(0) += 1;
        self.bus.publish(StationEvent::DeviceRemoved {
            device: device.clone(),
        });

        let key = self.readds.insert(device.clone(), self.config.readd_delay);
        if let Some(old) = self.readd_keys.insert(device.usb_path, key) {
            self.readds.remove(&old);
        }
    }

    async fn stall(&self, driver: Arc<dyn DeviceDriver>, reason: &str) {
        if let Err(e) = driver.stalled(reason).await {
            warn!(port = driver.device().port, error = %e, "could not restart stalled session");
        }
    }

    async fn on_upstream_died(&mut self, upstream: Upstream) {
        let drivers: Vec<_> = self
            .sessions
            .values()
            .filter(|s| s.driver.upstream() == upstream)
            .map(|s| s.driver.clone())
            .collect();
        if drivers.is_empty() {
            return;
        }
        warn!(%upstream, sessions = drivers.len(), "upstream died, restarting its sessions");
        let reason = format!("{upstream} died");
        for driver in drivers {
            self.stall(driver, &reason).await;
        }
    }

    fn update_settings(&mut self, port: u32, settings: Settings) {
        if let Some(session) = self.sessions.values_mut().find(|s| s.device.port == port) {
            session.device.settings.extend(settings);
        }
    }

    fn snapshot(&self) -> Vec<DeviceStatus> {
        let mut devices: Vec<_> = self
            .sessions
            .values()
            .map(|s| DeviceStatus {
                device: s.device.clone(),
                state: s.driver.state(),
                device_path: s.driver.device_path(),
            })
            .collect();
        devices.sort_by_key(|d| d.device.port);
        devices
    }

    async fn quit(&mut self) {
        info!(sessions = self.sessions.len(), "station quitting");
        self.readds.clear();
        self.readd_keys.clear();
        let paths: Vec<String> = self.sessions.keys().cloned().collect();
        for path in paths {
            self.remove_session(&path).await;
        }
        self.factory.shutdown().await;
    }
}
