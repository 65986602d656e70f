//! Conversion between natural units and device-native integer encodings.
//!
//! Configuration and external consumers speak natural units (MHz, dB,
//! on/off); driven processes expect integers. Conversion happens only at
//! the codec boundary, through the [`ParamTable`].

use crate::error::{Error, Result};
use crate::types::Settings;

/// How one parameter maps between natural and native units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Unit {
    /// Natural MHz, native Hz.
    Megahertz,
    /// Natural and native values are the same integer.
    Identity,
    /// Native value is the natural value times `factor`.
    Scaled { factor: f64 },
    /// Any non-zero natural value is sent as 1.
    Flag,
}

impl Unit {
    /// Convert a natural-unit value to its native integer.
    ///
    /// ```
    /// use sdrlib_core::Unit;
    ///
    /// assert_eq!(Unit::Megahertz.to_native(166.376).unwrap(), 166_376_000);
    /// assert_eq!(Unit::Flag.to_native(1.0).unwrap(), 1);
    /// ```
    pub fn to_native(self, natural: f64) -> Result<i64> {
        if !natural.is_finite() {
            return Err(Error::InvalidParameter(format!(
                "value {natural} is not a finite number"
            )));
        }
        let native = match self {
            Unit::Megahertz => (natural * 1e6).round(),
            Unit::Identity => natural.round(),
            Unit::Scaled { factor } => (natural * factor).round(),
            Unit::Flag => {
                if natural != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        };
        Ok(native as i64)
    }

    /// Convert a native value back to natural units.
    pub fn to_natural(self, native: f64) -> f64 {
        match self {
            Unit::Megahertz => native / 1e6,
            Unit::Identity => native,
            Unit::Scaled { factor } => native / factor,
            Unit::Flag => {
                if native != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// One row of a driver's parameter table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    /// Parameter name as used in plans and on text channels.
    pub name: &'static str,
    /// Command number on binary channels.
    pub code: u8,
    /// Unit mapping.
    pub unit: Unit,
}

/// The set of parameters a driver understands.
#[derive(Debug, Clone, Copy)]
pub struct ParamTable {
    specs: &'static [ParamSpec],
}

/// Parameters understood by the station's receivers.
#[rustfmt::skip]
pub const STANDARD_PARAMS: &[ParamSpec] = &[
    ParamSpec { name: "frequency", code: 1, unit: Unit::Megahertz },
    ParamSpec { name: "rate", code: 2, unit: Unit::Identity },
    ParamSpec { name: "lna_gain", code: 3, unit: Unit::Identity },
    ParamSpec { name: "mixer_gain", code: 4, unit: Unit::Identity },
    ParamSpec { name: "vga_gain", code: 5, unit: Unit::Identity },
    ParamSpec { name: "linearity_gain", code: 6, unit: Unit::Identity },
    ParamSpec { name: "sensitivity_gain", code: 7, unit: Unit::Identity },
    ParamSpec { name: "lna_agc", code: 8, unit: Unit::Flag },
    ParamSpec { name: "mixer_agc", code: 9, unit: Unit::Flag },
    ParamSpec { name: "agc", code: 10, unit: Unit::Flag },
    ParamSpec { name: "bias_tee", code: 11, unit: Unit::Flag },
    ParamSpec { name: "streaming", code: 15, unit: Unit::Flag },
];

impl ParamTable {
    pub const fn new(specs: &'static [ParamSpec]) -> Self {
        ParamTable { specs }
    }

    /// The table every bundled driver uses.
    pub const fn standard() -> Self {
        ParamTable::new(STANDARD_PARAMS)
    }

    /// All rows in table order.
    pub fn specs(&self) -> &'static [ParamSpec] {
        self.specs
    }

    /// Find a parameter by name.
    pub fn lookup(&self, name: &str) -> Result<&'static ParamSpec> {
        self.specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))
    }

    /// Convert a natural value for `name` into its native integer.
    pub fn to_native(&self, name: &str, natural: f64) -> Result<i64> {
        self.lookup(name)?.unit.to_native(natural)
    }

    /// Convert a settings report from native to natural units.
    ///
    /// Numeric entries for known parameters are converted; everything else
    /// passes through untouched.
    pub fn report_to_natural(&self, report: &Settings) -> Settings {
        report
            .iter()
            .map(|(name, value)| {
                let converted = match (self.lookup(name), value.as_f64()) {
                    (Ok(spec), Some(native)) => {
                        let natural = spec.unit.to_natural(native);
                        serde_json::Number::from_f64(natural)
                            .map(serde_json::Value::Number)
                            .unwrap_or_else(|| value.clone())
                    }
                    _ => value.clone(),
                };
                (name.clone(), converted)
            })
            .collect()
    }
}

impl Default for ParamTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frequency_worked_value() {
        let t = ParamTable::standard();
        assert_eq!(t.to_native("frequency", 166.376).unwrap(), 166_376_000);
        let back = t.lookup("frequency").unwrap().unit.to_natural(166_376_000.0);
        assert!((back - 166.376).abs() < 1e-9);
    }

    #[test]
    fn frequency_rounds_to_nearest_hz() {
        assert_eq!(Unit::Megahertz.to_native(150.0000004).unwrap(), 150_000_000);
        assert_eq!(Unit::Megahertz.to_native(150.0000006).unwrap(), 150_000_001);
    }

    #[test]
    fn every_standard_param_survives_the_trip() {
        let t = ParamTable::standard();
        for spec in t.specs() {
            let natural = match spec.unit {
                Unit::Megahertz => 433.92,
                Unit::Flag => 1.0,
                _ => 14.0,
            };
            let native = spec.unit.to_native(natural).unwrap();
            let back = spec.unit.to_natural(native as f64);
            assert!((back - natural).abs() < 1e-6, "{} drifted", spec.name);
        }
    }

    #[test]
    fn scaled_unit_resolution() {
        let u = Unit::Scaled { factor: 10.0 };
        assert_eq!(u.to_native(4.5).unwrap(), 45);
        assert_eq!(u.to_natural(45.0), 4.5);
        // Finer than one step is lost to rounding.
        assert_eq!(u.to_native(4.54).unwrap(), 45);
    }

    #[test]
    fn flags_are_zero_or_one() {
        assert_eq!(Unit::Flag.to_native(0.0).unwrap(), 0);
        assert_eq!(Unit::Flag.to_native(3.0).unwrap(), 1);
        assert_eq!(Unit::Flag.to_natural(7.0), 1.0);
    }

    #[test]
    fn non_finite_rejected() {
        assert!(matches!(
            Unit::Identity.to_native(f64::NAN),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn unknown_parameter_rejected() {
        let t = ParamTable::standard();
        match t.to_native("if_gain", 3.0) {
            Err(Error::UnknownParameter(name)) => assert_eq!(name, "if_gain"),
            other => panic!("expected UnknownParameter, got {other:?}"),
        }
    }

    #[test]
    fn command_codes_match_wire_table() {
        let t = ParamTable::standard();
        assert_eq!(t.lookup("frequency").unwrap().code, 1);
        assert_eq!(t.lookup("bias_tee").unwrap().code, 11);
        assert_eq!(t.lookup("streaming").unwrap().code, 15);
    }

    #[test]
    fn report_converts_frequency_only_for_known_numbers() {
        let t = ParamTable::standard();
        let mut report = Settings::new();
        report.insert("frequency".into(), json!(166376000));
        report.insert("lna_gain".into(), json!(10));
        report.insert("serial".into(), json!("a74068c82f4e3c53"));
        let natural = t.report_to_natural(&report);
        assert_eq!(natural["frequency"].as_f64(), Some(166.376));
        assert_eq!(natural["lna_gain"].as_f64(), Some(10.0));
        assert_eq!(natural["serial"], json!("a74068c82f4e3c53"));
    }
}
