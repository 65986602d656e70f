//! Station-wide notifications.
//!
//! Every component that needs to tell the rest of the station something
//! publishes a [`StationEvent`] on the [`EventBus`]. The bus is created once
//! at start-up and handed to each component; nothing reaches for a global.
//!
//! Delivery uses a bounded [`tokio::sync::broadcast`] channel, so a
//! subscriber that falls far behind will see `Lagged` and miss events.
//! Control events ([`StationEvent::is_control`]) are also copied onto an
//! unbounded lane that the station registry drains, so a burst of
//! telemetry can never cost the registry a restart.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::types::{Device, DriverKind, Settings};

/// A process that consumes a device's data on the station's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    /// The vendor server for a two-socket device.
    Vah,
    /// The shared flow-graph bridge.
    Bridge,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upstream::Vah => write!(f, "vah"),
            Upstream::Bridge => write!(f, "bridge"),
        }
    }
}

/// A notification published on the station bus.
#[derive(Debug, Clone)]
pub enum StationEvent {
    /// A device appeared, or is being re-added after a restart.
    DeviceAdded {
        device: Device,
    },

    /// A device went away, or is being removed ahead of a restart.
    DeviceRemoved {
        device: Device,
    },

    /// A session wants to be torn down and recreated from scratch.
    RestartRequested {
        device: Device,
        /// Human-readable cause.
        reason: String,
    },

    /// A driven process failed.
    ///
    /// `port` is `None` when the failing process is shared by several
    /// devices.
    DeviceError {
        port: Option<u32>,
        message: String,
    },

    /// A monitored stream stopped producing data at the expected rate.
    DeviceStalled {
        /// Port label, e.g. `"p3"`.
        label: String,
        reason: String,
    },

    /// A parameter could not be applied.
    ParamSetError {
        port: u32,
        driver: DriverKind,
        param: String,
        value: f64,
        error: String,
    },

    /// Current settings reported by the driven process, frequency in MHz.
    Settings {
        port: u32,
        settings: Settings,
    },

    /// One line of raw output for external logging.
    RawLine {
        source: String,
        line: String,
    },

    /// A process consuming device data died.
    UpstreamDied {
        upstream: Upstream,
    },

    /// The shared bridge process has been (re)started.
    BridgeStarted,

    /// An asynchronous notification from the bridge.
    BridgeNotification {
        event: String,
        label: Option<String>,
        payload: Value,
    },

    /// Cumulative frame count reported for a port.
    FrameCount {
        label: String,
        frames: u64,
    },

    /// Frame rate observed for a port over the last check interval.
    FrameRate {
        label: String,
        rate: f64,
    },

    /// The station is shutting down.
    Quit,
}

impl StationEvent {
    /// Events that drive the station registry rather than report on it.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            StationEvent::DeviceAdded { .. }
                | StationEvent::DeviceRemoved { .. }
                | StationEvent::RestartRequested { .. }
                | StationEvent::DeviceStalled { .. }
                | StationEvent::UpstreamDied { .. }
                | StationEvent::Settings { .. }
                | StationEvent::Quit
        )
    }
}

/// Default number of events buffered per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Broadcast bus shared by the station, its sessions, and the bridge.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StationEvent>,
    control: Arc<Mutex<Option<mpsc::UnboundedSender<StationEvent>>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus {
            tx,
            control: Arc::new(Mutex::new(None)),
        }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: StationEvent) {
        if event.is_control() {
            let control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(lane) = control.as_ref() {
                let _ = lane.send(event.clone());
            }
        }
        let _ = self.tx.send(event);
    }

    /// Take the lossless lane of control events.
    ///
    /// Only one lane exists per bus; taking it again closes the previous
    /// receiver. Control events published before this call are not replayed.
    pub fn control_events(&self) -> mpsc::UnboundedReceiver<StationEvent> {
        let (lane, rx) = mpsc::unbounded_channel();
        *self.control.lock().unwrap_or_else(PoisonError::into_inner) = Some(lane);
        rx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
