//! Throughput health monitoring for multiplexed data streams.
//!
//! The bridge answers a `list` query with a per-label status object. The
//! [`HealthMonitor`] compares successive frame counts for every label it
//! tracks, turns them into a rate, and holds each label to its nominal rate
//! within a tolerance band. A label must fail several consecutive checks
//! before a stall is raised. A label that vanishes from the report, or stops
//! counting frames altogether, is declared stalled at once.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Status `type` of a label that produces frames.
pub const PLUGIN_RUNNER: &str = "PluginRunner";

/// Rate-check tuning.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between `list` queries.
    pub interval: Duration,
    /// Allowed deviation from nominal rate, in percent.
    pub tolerance_pct: f64,
    /// Consecutive out-of-band checks that raise a stall.
    pub max_out_of_bounds: u32,
    /// Number of in-band rate reports logged at `info` before going quiet.
    pub verbose_reports: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            interval: Duration::from_secs(10),
            tolerance_pct: 5.0,
            max_out_of_bounds: 2,
            verbose_reports: 100,
        }
    }
}

/// One label's entry in a status report.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusEntry {
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Nominal frame rate.
    #[serde(default)]
    pub rate: f64,
    /// Cumulative frames produced.
    #[serde(rename = "totalFrames", default)]
    pub total_frames: u64,
}

/// A parsed reply to a `list` query, keyed by label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    pub entries: BTreeMap<String, StatusEntry>,
}

impl HealthReport {
    /// Parse a `list` reply.
    ///
    /// Entries that are not objects describing a status are skipped, as are
    /// fields the monitor does not use.
    pub fn from_value(value: &Value) -> Self {
        let mut entries = BTreeMap::new();
        if let Some(map) = value.as_object() {
            for (label, entry) in map {
                match StatusEntry::deserialize(entry) {
                    Ok(status) => {
                        entries.insert(label.clone(), status);
                    }
                    Err(e) => debug!(label = %label, error = %e, "skipping status entry"),
                }
            }
        }
        HealthReport { entries }
    }

    pub fn with_entry(mut self, label: impl Into<String>, entry: StatusEntry) -> Self {
        self.entries.insert(label.into(), entry);
        self
    }
}

/// Something the monitor observed during a check.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// Cumulative frame count for a label.
    Frames { label: String, frames: u64 },
    /// Rate computed over the last interval.
    Rate { label: String, rate: f64 },
    /// The label should be restarted.
    Stalled { label: String, reason: String },
}

#[derive(Debug, Clone)]
struct Track {
    at: Instant,
    /// `None` until the first report after acceptance sets a baseline.
    frames: Option<u64>,
    bad: u32,
}

/// Per-label throughput tracker.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    tracks: HashMap<String, Track>,
    reports_logged: u32,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        HealthMonitor {
            config,
            tracks: HashMap::new(),
            reports_logged: 0,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start tracking `label`. Any previous history is discarded.
    pub fn accept(&mut self, label: &str, now: Instant) {
        self.tracks.insert(
            label.to_string(),
            Track {
                at: now,
                frames: None,
                bad: 0,
            },
        );
    }

    /// Stop tracking `label`.
    pub fn forget(&mut self, label: &str) -> bool {
        self.tracks.remove(label).is_some()
    }

    /// Drop every label, e.g. when the bridge restarts.
    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn is_tracking(&self, label: &str) -> bool {
        self.tracks.contains_key(label)
    }

    /// Labels currently tracked, sorted.
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<_> = self.tracks.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Judge every tracked label against `report`.
    pub fn check(&mut self, report: &HealthReport, now: Instant) -> Vec<HealthEvent> {
        let min_dt = self.config.interval.mul_f64(0.9);
        let lo = 1.0 - self.config.tolerance_pct / 100.0;
        let hi = 1.0 + self.config.tolerance_pct / 100.0;
        let mut events = Vec::new();
        let mut dead = Vec::new();

        for label in self.labels() {
            let Some(track) = self.tracks.get_mut(&label) else {
                continue;
            };

            let Some(status) = report.entries.get(&label) else {
                let had_frames = track.frames.is_some_and(|f| f > 0);
                if had_frames || now.duration_since(track.at) > min_dt {
                    warn!(label = %label, "port is missing from status report");
                    dead.push((label.clone(), format!("port {label} is not producing data")));
                }
                continue;
            };

            if status.kind != PLUGIN_RUNNER {
                debug!(label = %label, kind = %status.kind, "status entry is not a plugin");
                continue;
            }

            events.push(HealthEvent::Frames {
                label: label.clone(),
                frames: status.total_frames,
            });

            let Some(prev) = track.frames else {
                track.at = now;
                track.frames = Some(status.total_frames);
                continue;
            };

            let dt = now.duration_since(track.at);
            if dt < min_dt {
                continue;
            }

            let df = status.total_frames.saturating_sub(prev);
            if df == 0 {
                warn!(label = %label, "frame count has not advanced");
                dead.push((label.clone(), format!("port {label} is not producing data")));
                continue;
            }

            let rate = df as f64 / dt.as_secs_f64();
            events.push(HealthEvent::Rate {
                label: label.clone(),
                rate,
            });

            let in_band = rate >= status.rate * lo && rate <= status.rate * hi;
            if !in_band {
                warn!(
                    label = %label,
                    nominal = status.rate,
                    actual = rate.round(),
                    "frame rate out of band"
                );
                track.bad += 1;
            } else {
                if self.reports_logged < self.config.verbose_reports {
                    self.reports_logged += 1;
                    info!(
                        label = %label,
                        nominal = status.rate,
                        actual = rate.round(),
                        "frame rate"
                    );
                }
                track.bad = 0;
            }

            if track.bad >= self.config.max_out_of_bounds {
                track.bad = 0;
                events.push(HealthEvent::Stalled {
                    label: label.clone(),
                    reason: format!(
                        "rate for {label} is out of range: nominal {}, actual {rate:.0} frames/sec",
                        status.rate
                    ),
                });
            }

            track.at = now;
            track.frames = Some(status.total_frames);
        }

        for (label, reason) in dead {
            self.tracks.remove(&label);
            events.push(HealthEvent::Stalled { label, reason });
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plugin(rate: f64, total_frames: u64) -> StatusEntry {
        StatusEntry {
            kind: PLUGIN_RUNNER.into(),
            rate,
            total_frames,
        }
    }

    fn report(label: &str, entry: StatusEntry) -> HealthReport {
        HealthReport::default().with_entry(label, entry)
    }

    fn stalls(events: &[HealthEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                HealthEvent::Stalled { label, .. } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default())
    }

    const TICK: Duration = Duration::from_secs(10);

    #[test]
    fn first_report_only_sets_baseline() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.accept("p1", t0);
        let events = m.check(&report("p1", plugin(1000.0, 5_000)), t0 + TICK);
        assert_eq!(
            events,
            vec![HealthEvent::Frames {
                label: "p1".into(),
                frames: 5_000
            }]
        );
    }

    #[test]
    fn in_band_rate_reported() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.accept("p1", t0);
        m.check(&report("p1", plugin(1000.0, 0)), t0);
        let events = m.check(&report("p1", plugin(1000.0, 10_000)), t0 + TICK);
        assert!(events.contains(&HealthEvent::Rate {
            label: "p1".into(),
            rate: 1000.0
        }));
        assert!(stalls(&events).is_empty());
    }

    #[test]
    fn tolerance_band_is_inclusive() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.accept("p1", t0);
        m.check(&report("p1", plugin(1000.0, 1)), t0);
        // 950 and 1050 frames/sec sit exactly on the 5% edges.
        let mut t = t0;
        let mut frames = 1;
        for rate in [950, 1050, 950, 1050] {
            t += TICK;
            frames += rate * 10;
            let events = m.check(&report("p1", plugin(1000.0, frames)), t);
            assert!(stalls(&events).is_empty(), "rate {rate} should be in band");
        }
    }

    #[test]
    fn single_dip_tolerated_second_raises_stall() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.accept("p1", t0);
        m.check(&report("p1", plugin(1000.0, 1)), t0);

        let e1 = m.check(&report("p1", plugin(1000.0, 1 + 9_000)), t0 + TICK);
        assert!(stalls(&e1).is_empty());

        let e2 = m.check(&report("p1", plugin(1000.0, 1 + 18_000)), t0 + TICK * 2);
        assert_eq!(stalls(&e2), vec!["p1"]);
        // Still tracked; the counter restarts.
        assert!(m.is_tracking("p1"));
        let e3 = m.check(&report("p1", plugin(1000.0, 1 + 27_000)), t0 + TICK * 3);
        assert!(stalls(&e3).is_empty());
    }

    #[test]
    fn recovery_resets_hysteresis() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.accept("p1", t0);
        m.check(&report("p1", plugin(1000.0, 1)), t0);
        let mut frames = 1;
        let mut t = t0;
        for rate in [800, 1000, 800, 1000, 800] {
            t += TICK;
            frames += rate * 10;
            let events = m.check(&report("p1", plugin(1000.0, frames)), t);
            assert!(stalls(&events).is_empty());
        }
    }

    #[test]
    fn too_soon_is_skipped() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.accept("p1", t0);
        m.check(&report("p1", plugin(1000.0, 1)), t0);
        let events = m.check(&report("p1", plugin(1000.0, 2)), t0 + Duration::from_secs(2));
        assert!(!events.iter().any(|e| matches!(e, HealthEvent::Rate { .. })));
    }

    #[test]
    fn absent_label_with_frames_stalls_immediately() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.accept("p2", t0);
        m.check(&report("p2", plugin(1000.0, 500)), t0);
        let events = m.check(&HealthReport::default(), t0 + Duration::from_secs(1));
        assert_eq!(stalls(&events), vec!["p2"]);
        assert!(!m.is_tracking("p2"));
    }

    #[test]
    fn absent_label_before_first_report_gets_grace() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.accept("p2", t0);
        let early = m.check(&HealthReport::default(), t0 + Duration::from_secs(1));
        assert!(stalls(&early).is_empty());
        let late = m.check(&HealthReport::default(), t0 + TICK);
        assert_eq!(stalls(&late), vec!["p2"]);
    }

    #[test]
    fn zero_progress_stalls_without_hysteresis() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.accept("p3", t0);
        m.check(&report("p3", plugin(1000.0, 700)), t0);
        let events = m.check(&report("p3", plugin(1000.0, 700)), t0 + TICK);
        assert_eq!(stalls(&events), vec!["p3"]);
    }

    #[test]
    fn non_plugin_entries_ignored() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.accept("p1", t0);
        let entry = StatusEntry {
            kind: "Source".into(),
            ..Default::default()
        };
        let events = m.check(&report("p1", entry), t0 + TICK * 5);
        assert!(events.is_empty());
    }

    #[test]
    fn untracked_labels_ignored() {
        let mut m = monitor();
        let events = m.check(&report("p9", plugin(1000.0, 10)), Instant::now());
        assert!(events.is_empty());
    }

    #[test]
    fn report_parses_list_reply() {
        let value = json!({
            "p1": {"type": "PluginRunner", "rate": 1000, "totalFrames": 12345},
            "p2": {"type": "Source"},
            "clock": 17
        });
        let r = HealthReport::from_value(&value);
        assert_eq!(r.entries["p1"], plugin(1000.0, 12345));
        assert_eq!(r.entries["p2"].kind, "Source");
        assert!(!r.entries.contains_key("clock"));
    }
}
