//! Core types used throughout sdrlib.
//!
//! These types describe the station's view of a radio peripheral: which
//! physical device it is, which driver variant talks to it, and the
//! configuration it should be brought up with.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Last-known parameter values as reported by the driven process.
///
/// Values are in natural units (frequency in MHz); the raw JSON value is
/// kept so parameters the station does not know about still round-trip.
pub type Settings = BTreeMap<String, serde_json::Value>;

/// Driver variant for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Vendor TCP-style server reached through a command socket with a
    /// 5-byte binary protocol.
    Airspy,
    /// A port multiplexed through the shared flow-graph bridge process.
    #[serde(alias = "gnuradio")]
    GnuRadio,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Airspy => write!(f, "airspy"),
            DriverKind::GnuRadio => write!(f, "gnuradio"),
        }
    }
}

/// One physical radio attached to the station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable USB path in `bus:device` form, e.g. `"1:4"`.
    pub usb_path: String,
    /// Logical port number on the station hub.
    pub port: u32,
    /// Which driver variant controls this device.
    pub kind: DriverKind,
    /// Hardware serial number, when known.
    #[serde(default)]
    pub serial: Option<String>,
    /// Last-known parameter values.
    #[serde(default)]
    pub settings: Settings,
}

impl Device {
    /// Create a device record with no serial and empty settings.
    pub fn new(usb_path: impl Into<String>, port: u32, kind: DriverKind) -> Self {
        Device {
            usb_path: usb_path.into(),
            port,
            kind,
            serial: None,
            settings: Settings::new(),
        }
    }

    /// Set the hardware serial number.
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Stable per-port label used to key bookkeeping in shared processes.
    ///
    /// ```
    /// use sdrlib_core::{Device, DriverKind};
    ///
    /// assert_eq!(Device::new("1:4", 3, DriverKind::GnuRadio).label(), "p3");
    /// ```
    pub fn label(&self) -> String {
        format!("p{}", self.port)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} port {} ({})", self.kind, self.port, self.usb_path)
    }
}

/// A single named parameter value in natural units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSetting {
    /// Parameter name, e.g. `"frequency"` or `"lna_gain"`.
    pub name: String,
    /// Value in natural units (MHz, dB, 0/1 for flags).
    pub value: f64,
}

impl ParamSetting {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        ParamSetting {
            name: name.into(),
            value,
        }
    }
}

/// Offset in MHz between a configured reference frequency and the tuned
/// frequency.
///
/// Empirical value carried over from deployed stations; its physical origin
/// is unknown and it should be reviewed by someone who knows the receivers.
pub const REFERENCE_OFFSET_MHZ: f64 = 0.004;

/// Plan rates the station knows how to serve.
pub const SUPPORTED_RATES: [u32; 4] = [48_000, 3_000_000, 6_000_000, 10_000_000];

/// Rate served when a plan asks for an unsupported rate, or for none.
pub const FALLBACK_RATE: u32 = 48_000;

/// Desired configuration for a device.
///
/// A plan is handed to a session once and re-applied unchanged after every
/// restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Requested sample rate in samples per second; 0 when unset.
    #[serde(default)]
    pub rate: u32,
    /// Initial parameter values in natural units.
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

impl Plan {
    pub fn new(rate: u32) -> Self {
        Plan {
            rate,
            params: BTreeMap::new(),
        }
    }

    /// Add an initial parameter value.
    pub fn with_param(mut self, name: impl Into<String>, value: f64) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    /// Look up an initial parameter value.
    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }

    /// Initial parameter values in application order.
    pub fn settings(&self) -> Vec<ParamSetting> {
        self.params
            .iter()
            .map(|(name, value)| ParamSetting::new(name.clone(), *value))
            .collect()
    }

    /// The sample rate a session serves for this plan.
    ///
    /// ```
    /// use sdrlib_core::{FALLBACK_RATE, Plan};
    ///
    /// assert_eq!(Plan::new(3_000_000).effective_rate(), 3_000_000);
    /// assert_eq!(Plan::new(2_400_000).effective_rate(), FALLBACK_RATE);
    /// ```
    pub fn effective_rate(&self) -> u32 {
        if SUPPORTED_RATES.contains(&self.rate) {
            self.rate
        } else {
            warn!(
                requested = self.rate,
                fallback = FALLBACK_RATE,
                "requested rate not within hardware range"
            );
            FALLBACK_RATE
        }
    }

    /// Set the plan frequency from a configured reference frequency in MHz.
    ///
    /// The tuned frequency sits [`REFERENCE_OFFSET_MHZ`] below the reference.
    pub fn retune_to_reference(&mut self, reference_mhz: f64) {
        self.params
            .insert("frequency".into(), reference_mhz - REFERENCE_OFFSET_MHZ);
    }
}

/// Source of plans for devices as they appear.
///
/// Loading and persisting plans is the job of an external collaborator;
/// the station only asks for the plan that matches a device.
pub trait PlanSource: Send + Sync {
    /// Return the plan for `device`, or `None` if the device should be ignored.
    fn plan_for(&self, device: &Device) -> Option<Plan>;
}

/// A fixed set of plans keyed by port, with an optional fallback.
#[derive(Debug, Clone, Default)]
pub struct StaticPlans {
    by_port: HashMap<u32, Plan>,
    fallback: Option<Plan>,
}

impl StaticPlans {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `plan` for the device on `port`.
    pub fn with_port(mut self, port: u32, plan: Plan) -> Self {
        self.by_port.insert(port, plan);
        self
    }

    /// Use `plan` for any port without its own entry.
    pub fn with_fallback(mut self, plan: Plan) -> Self {
        self.fallback = Some(plan);
        self
    }
}

impl PlanSource for StaticPlans {
    fn plan_for(&self, device: &Device) -> Option<Plan> {
        self.by_port
            .get(&device.port)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// Lookup of a hardware serial number from a USB path.
pub trait SerialLookup: Send + Sync {
    fn serial_for(&self, usb_path: &str) -> Option<String>;
}

/// Serial numbers supplied up front, keyed by USB path.
#[derive(Debug, Clone, Default)]
pub struct StaticSerials(HashMap<String, String>);

impl StaticSerials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_serial(mut self, usb_path: impl Into<String>, serial: impl Into<String>) -> Self {
        self.0.insert(usb_path.into(), serial.into());
        self
    }
}

impl SerialLookup for StaticSerials {
    fn serial_for(&self, usb_path: &str) -> Option<String> {
        self.0.get(usb_path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_label_and_display() {
        let dev = Device::new("1:4", 2, DriverKind::Airspy);
        assert_eq!(dev.label(), "p2");
        assert_eq!(dev.to_string(), "airspy port 2 (1:4)");
    }

    #[test]
    fn device_deserializes_from_json() {
        let dev: Device =
            serde_json::from_str(r#"{"usb_path":"1:7","port":5,"kind":"gnuradio"}"#).unwrap();
        assert_eq!(dev.kind, DriverKind::GnuRadio);
        assert_eq!(dev.serial, None);
        assert!(dev.settings.is_empty());
    }

    #[test]
    fn plan_deserializes_with_params() {
        let plan: Plan =
            serde_json::from_str(r#"{"rate":6000000,"params":{"frequency":166.376,"lna_gain":10}}"#)
                .unwrap();
        assert_eq!(plan.rate, 6_000_000);
        assert_eq!(plan.param("frequency"), Some(166.376));
        assert_eq!(plan.param("lna_gain"), Some(10.0));
        assert_eq!(plan.param("vga_gain"), None);
    }

    #[test]
    fn plan_without_rate_falls_back() {
        let plan: Plan = serde_json::from_str(r#"{"params":{"frequency":166.376}}"#).unwrap();
        assert_eq!(plan.rate, 0);
        assert_eq!(plan.effective_rate(), FALLBACK_RATE);
        assert_eq!(Plan::new(10_000_000).effective_rate(), 10_000_000);
        assert_eq!(Plan::new(2_400_000).effective_rate(), 48_000);
    }

    #[test]
    fn plan_settings_in_name_order() {
        let plan = Plan::new(48_000)
            .with_param("vga_gain", 5.0)
            .with_param("frequency", 150.1);
        let names: Vec<_> = plan.settings().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["frequency", "vga_gain"]);
    }

    #[test]
    fn retune_applies_reference_offset() {
        let mut plan = Plan::new(48_000);
        plan.retune_to_reference(166.380);
        let f = plan.param("frequency").unwrap();
        assert!((f - 166.376).abs() < 1e-9);
    }

    #[test]
    fn static_plans_port_then_fallback() {
        let plans = StaticPlans::new()
            .with_port(1, Plan::new(3_000_000))
            .with_fallback(Plan::new(48_000));
        let p1 = Device::new("1:2", 1, DriverKind::Airspy);
        let p4 = Device::new("1:3", 4, DriverKind::Airspy);
        assert_eq!(plans.plan_for(&p1).unwrap().rate, 3_000_000);
        assert_eq!(plans.plan_for(&p4).unwrap().rate, 48_000);
        assert!(StaticPlans::new().plan_for(&p1).is_none());
    }

    #[test]
    fn static_serials_lookup() {
        let serials = StaticSerials::new().with_serial("1:4", "A0000000deadbeef");
        assert_eq!(serials.serial_for("1:4").as_deref(), Some("A0000000deadbeef"));
        assert_eq!(serials.serial_for("1:5"), None);
    }
}
