//! Risk Analyzer — per-category threshold evaluation with confirmation
//! debounce, plus long-term velocity/trend classification. Stateless except
//! for the per-(station, category) confirmation counters. Grounded on
//! `original_source/backend/app/landslide_analyzer.py::LandslideAnalyzer`;
//! message text is original to this implementation (the source's strings are
//! Vietnamese and emoji-laden — see SPEC_FULL.md §4.3).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::models::AlertLevel;
use crate::state::{StationConfig, VelocityClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Category {
    Gnss,
    Rain,
    Water,
    Imu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Default)]
struct Counter {
    count: u32,
    last_level: Option<CandidateLevel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub category: &'static str,
    pub message: String,
    pub details: Value,
}

/// Classifies a velocity (mm/s) against a station's normalized, descending
/// classification table. Falls back to "Stable" if nothing matches.
fn classify_velocity(velocity_mm_s: f64, table: &[VelocityClass]) -> String {
    let mut normalized: Vec<(String, f64)> = table
        .iter()
        .map(|c| (c.name.clone(), c.unit.to_mm_per_sec(c.threshold)))
        .collect();
    normalized.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    for (name, threshold) in &normalized {
        if velocity_mm_s >= *threshold {
            return name.clone();
        }
    }
    "Stable".to_string()
}

/// Keyed per-station, per-category debounce state. Accessed only from the
/// processing task handling the owning station's devices for that category,
/// per the concurrency model — the mutex exists for `Send + Sync`, not to
/// arbitrate real contention.
pub struct RiskAnalyzer {
    counters: Mutex<HashMap<(i64, Category), Counter>>,
}

impl RiskAnalyzer {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Generic two-sided debounce: a changed dangerous level resets the
    /// counter and never fires on that same step; the alert fires only once
    /// the level has held steady for `confirm_steps` consecutive samples. A
    /// safe sample decrements the counter toward zero rather than clearing it
    /// outright, so a single safe reading mid-streak does not cancel an
    /// active alarm.
    fn debounce(&self, station_id: i64, category: Category, candidate: CandidateLevel, confirm_steps: u32) -> Option<CandidateLevel> {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry((station_id, category)).or_default();
        match candidate {
            CandidateLevel::Warning | CandidateLevel::Critical => {
                if counter.last_level != Some(candidate) {
                    counter.count = 1;
                    counter.last_level = Some(candidate);
                    None
                } else {
                    counter.count += 1;
                    if counter.count >= confirm_steps.max(1) {
                        Some(candidate)
                    } else {
                        None
                    }
                }
            }
            CandidateLevel::Info => {
                if counter.count > 0 {
                    counter.count -= 1;
                }
                if counter.count == 0 {
                    counter.last_level = None;
                }
                None
            }
        }
    }

    /// IMU shock debounce is special-cased: a `confirm_steps = 1`
    /// configuration (the default) must fire on the very first dangerous
    /// sample rather than waiting for a second confirming sample, matching
    /// the original processor's shock-is-immediate behavior.
    fn debounce_imu(&self, station_id: i64, candidate: CandidateLevel, confirm_steps: u32) -> Option<CandidateLevel> {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry((station_id, Category::Imu)).or_default();
        match candidate {
            CandidateLevel::Critical => {
                if counter.last_level != Some(CandidateLevel::Critical) {
                    counter.count = 1;
                    counter.last_level = Some(CandidateLevel::Critical);
                    if confirm_steps <= 1 {
                        Some(CandidateLevel::Critical)
                    } else {
                        None
                    }
                } else {
                    counter.count += 1;
                    if counter.count >= confirm_steps.max(1) {
                        Some(CandidateLevel::Critical)
                    } else {
                        None
                    }
                }
            }
            _ => {
                if counter.count > 0 {
                    counter.count -= 1;
                }
                if counter.count == 0 {
                    counter.last_level = None;
                }
                None
            }
        }
    }

    fn level_to_alert(level: CandidateLevel) -> AlertLevel {
        match level {
            CandidateLevel::Critical => AlertLevel::Critical,
            _ => AlertLevel::Warning,
        }
    }

    pub fn analyze_gnss(
        &self,
        station_id: i64,
        record: &crate::processors::gnss::GnssRecord,
        config: &StationConfig,
    ) -> Option<Alert> {
        let velocity_mm_s = record.speed_2d * 1000.0;
        let classification = classify_velocity(velocity_mm_s, &config.velocity_classification);
        let cls_upper = classification.to_uppercase();

        let candidate = if cls_upper.contains("EXTREMELY RAPID") || cls_upper.contains("VERY RAPID") {
            CandidateLevel::Critical
        } else if cls_upper.contains("RAPID") || cls_upper.contains("MODERATE") {
            CandidateLevel::Warning
        } else {
            CandidateLevel::Info
        };

        let confirmed = self.debounce(
            station_id,
            Category::Gnss,
            candidate,
            config.gnss_alerting.gnss_confirm_steps,
        )?;

        let message = match confirmed {
            CandidateLevel::Critical => format!(
                "extreme ground velocity: {velocity_mm_s:.2} mm/s ({classification})"
            ),
            _ => format!("rapid ground velocity: {velocity_mm_s:.4} mm/s ({classification})"),
        };

        Some(Alert {
            level: Self::level_to_alert(confirmed),
            category: "gnss_velocity",
            message,
            details: serde_json::json!({
                "velocity_mm_s": velocity_mm_s,
                "classification": classification,
                "confirmed_after": config.gnss_alerting.gnss_confirm_steps,
            }),
        })
    }

    pub fn analyze_rain(
        &self,
        station_id: i64,
        record: &crate::processors::rain::RainRecord,
        config: &StationConfig,
    ) -> Option<Alert> {
        let cfg = &config.rain_alerting;
        let intensity = record.intensity_mm_h;

        let candidate = if intensity >= cfg.rain_intensity_critical_threshold {
            CandidateLevel::Critical
        } else if intensity >= cfg.rain_intensity_warning_threshold {
            CandidateLevel::Warning
        } else {
            CandidateLevel::Info
        };

        let confirmed = self.debounce(station_id, Category::Rain, candidate, cfg.rain_confirm_steps)?;

        Some(Alert {
            level: Self::level_to_alert(confirmed),
            category: "rainfall",
            message: format!("heavy rainfall: {intensity:.1} mm/h"),
            details: serde_json::json!({ "val": intensity }),
        })
    }

    pub fn analyze_water(
        &self,
        station_id: i64,
        record: &crate::processors::water::WaterRecord,
        config: &StationConfig,
    ) -> Option<Alert> {
        let cfg = &config.water_alerting;
        let level = record.water_level;

        let candidate = if level >= cfg.critical_threshold {
            CandidateLevel::Critical
        } else if level >= cfg.warning_threshold {
            CandidateLevel::Warning
        } else {
            CandidateLevel::Info
        };

        let confirmed = self.debounce(station_id, Category::Water, candidate, cfg.water_confirm_steps)?;

        Some(Alert {
            level: Self::level_to_alert(confirmed),
            category: "water_level",
            message: format!("high water level: {level:.2} m"),
            details: serde_json::json!({ "val": level }),
        })
    }

    pub fn analyze_imu(
        &self,
        station_id: i64,
        record: &crate::processors::imu::ImuRecord,
        config: &StationConfig,
    ) -> Option<Alert> {
        let cfg = &config.imu_alerting;
        let candidate = if record.total_accel > cfg.shock_threshold_ms2 {
            CandidateLevel::Critical
        } else {
            CandidateLevel::Info
        };

        let confirmed = self.debounce_imu(station_id, candidate, cfg.imu_confirm_steps)?;

        Some(Alert {
            level: Self::level_to_alert(confirmed),
            category: "shock",
            message: format!("shock detected: {:.1} m/s\u{b2}", record.total_accel),
            details: serde_json::json!({ "val": record.total_accel }),
        })
    }

    /// Long-term velocity/trend analysis over a historical slice ordered by
    /// timestamp. `window_days` is accepted for interface symmetry with the
    /// spec (the caller is responsible for having already sliced the history
    /// to that window); this function reasons only about the span it's given.
    pub fn analyze_long_term(
        &self,
        historical: &[(f64, Value)],
        config: &StationConfig,
        _window_days: u32,
    ) -> LongTermResult {
        if historical.len() < 2 {
            return LongTermResult::InsufficientData {
                message: "need at least 2 data points".to_string(),
            };
        }

        let first = &historical[0];
        let last = &historical[historical.len() - 1];
        let duration_days = (last.0 - first.0) / 86_400.0;
        if duration_days < 0.1 {
            return LongTermResult::InsufficientData {
                message: "measurement span too short".to_string(),
            };
        }

        let get = |v: &Value, k: &str| v.get(k).and_then(Value::as_f64).unwrap_or(0.0);
        let delta_e = get(&last.1, "pos_e") - get(&first.1, "pos_e");
        let delta_n = get(&last.1, "pos_n") - get(&first.1, "pos_n");
        let delta_u = get(&last.1, "pos_u") - get(&first.1, "pos_u");

        let total_displacement_m = (delta_e.powi(2) + delta_n.powi(2) + delta_u.powi(2)).sqrt();
        let total_displacement_mm = total_displacement_m * 1000.0;

        let velocity_m_per_day = total_displacement_m / duration_days;
        let velocity_mm_day = velocity_m_per_day * 1000.0;
        let velocity_mm_year = velocity_mm_day * 365.0;
        let velocity_mm_s = velocity_mm_day / 86_400.0;

        let classification = classify_velocity(velocity_mm_s, &config.velocity_classification);
        let trend = detect_trend(historical);
        let (risk_level, message) = assess_risk(&classification, trend);

        LongTermResult::Success(LongTermAnalysis {
            total_displacement_mm: round2(total_displacement_mm),
            velocity_mm_year: round2(velocity_mm_year),
            velocity_mm_day: round4(velocity_mm_day),
            velocity_mm_s: round6(velocity_mm_s),
            classification,
            trend: trend.to_string(),
            duration_days: round1(duration_days),
            risk_level: risk_level.to_string(),
            message,
        })
    }
}

impl Default for RiskAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LongTermAnalysis {
    pub total_displacement_mm: f64,
    pub velocity_mm_year: f64,
    pub velocity_mm_day: f64,
    pub velocity_mm_s: f64,
    pub classification: String,
    pub trend: String,
    pub duration_days: f64,
    pub risk_level: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LongTermResult {
    Success(#[serde(flatten)] LongTermAnalysis),
    InsufficientData { message: String },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Trend {
    Accelerating,
    Decelerating,
    Stable,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trend::Accelerating => "accelerating",
            Trend::Decelerating => "decelerating",
            Trend::Stable => "stable",
        };
        write!(f, "{s}")
    }
}

/// Sign of the linear-regression slope of `speed_2d` across the window.
/// Requires at least 5 points; fewer is reported as stable.
fn detect_trend(historical: &[(f64, Value)]) -> Trend {
    let speeds: Vec<f64> = historical
        .iter()
        .filter_map(|(_, data)| data.get("speed_2d").and_then(Value::as_f64))
        .collect();
    if speeds.len() < 5 {
        return Trend::Stable;
    }

    let n = speeds.len() as f64;
    let xs: Vec<f64> = (0..speeds.len()).map(|i| i as f64).collect();
    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = speeds.iter().sum();
    let sum_xy: f64 = xs.iter().zip(&speeds).map(|(x, y)| x * y).sum();
    let sum_xx: f64 = xs.iter().map(|x| x * x).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return Trend::Stable;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;

    if slope > 1e-4 {
        Trend::Accelerating
    } else if slope < -1e-4 {
        Trend::Decelerating
    } else {
        Trend::Stable
    }
}

fn assess_risk(classification: &str, trend: Trend) -> (&'static str, String) {
    let cls_upper = classification.to_uppercase();
    if cls_upper.contains("EXTREMELY RAPID") || cls_upper.contains("VERY RAPID") {
        ("EXTREME", format!("extreme velocity ({classification})"))
    } else if cls_upper.contains("RAPID") {
        ("HIGH", format!("high velocity ({classification})"))
    } else if cls_upper.contains("MODERATE") {
        ("MEDIUM", format!("moderate ground movement ({classification})"))
    } else if cls_upper.contains("SLOW") || cls_upper.contains("STABLE") {
        if trend == Trend::Accelerating {
            ("MEDIUM", format!("accelerating despite low velocity ({classification})"))
        } else {
            ("LOW", format!("stable ({classification})"))
        }
    } else {
        ("LOW", format!("status: {classification}"))
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::imu::ImuRecord;
    use crate::processors::rain::RainRecord;
    use crate::processors::water::WaterRecord;
    use chrono::{DateTime, Utc};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn gnss_record(speed_2d: f64) -> crate::processors::gnss::GnssRecord {
        crate::processors::gnss::GnssRecord {
            timestamp: now(),
            lat: 0.0,
            lon: 0.0,
            h: 0.0,
            pos_e: 0.0,
            pos_n: 0.0,
            pos_u: 0.0,
            total_displacement_mm: 0.0,
            vel_e: speed_2d,
            vel_n: 0.0,
            vel_u: 0.0,
            speed_2d,
            speed_2d_mm_s: speed_2d * 1000.0,
            fix_quality: 4,
            num_sats: 8,
            hdop: 0.9,
        }
    }

    #[test]
    fn gnss_debounce_fires_on_third_confirming_sample() {
        let analyzer = RiskAnalyzer::new();
        let mut config = StationConfig::default();
        config.gnss_alerting.gnss_confirm_steps = 3;

        // "Rapid" class threshold is 0.5 mm/s; use a speed just above it.
        let rapid = gnss_record(0.0006);
        let slow = gnss_record(0.0);

        assert!(analyzer.analyze_gnss(1, &rapid, &config).is_none()); // count=1
        assert!(analyzer.analyze_gnss(1, &rapid, &config).is_none()); // count=2
        assert!(analyzer.analyze_gnss(1, &slow, &config).is_none()); // count decrements to 1
        assert!(analyzer.analyze_gnss(1, &rapid, &config).is_none()); // count=2
        let alert = analyzer.analyze_gnss(1, &rapid, &config).unwrap(); // count=3, fires
        assert_eq!(alert.level, AlertLevel::Warning);
    }

    #[test]
    fn imu_shock_fires_immediately_with_confirm_steps_one() {
        let analyzer = RiskAnalyzer::new();
        let config = StationConfig::default();
        let record = ImuRecord {
            ax: 0.0,
            ay: 0.0,
            az: 25.0,
            gx: 0.0,
            gy: 0.0,
            gz: 0.0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            total_accel: 25.0,
        };
        let alert = analyzer.analyze_imu(1, &record, &config).unwrap();
        assert_eq!(alert.level, AlertLevel::Critical);
        assert_eq!(alert.category, "shock");
        assert!((alert.details.get("val").unwrap().as_f64().unwrap() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn rain_debounce_waits_for_confirm_steps() {
        let analyzer = RiskAnalyzer::new();
        let config = StationConfig::default();
        let heavy = RainRecord {
            rainfall_mm: 1.0,
            intensity_mm_h: 60.0,
            is_fallback: false,
        };
        assert!(analyzer.analyze_rain(1, &heavy, &config).is_none());
        let alert = analyzer.analyze_rain(1, &heavy, &config).unwrap();
        assert_eq!(alert.level, AlertLevel::Critical);
    }

    #[test]
    fn water_below_threshold_never_fires() {
        let analyzer = RiskAnalyzer::new();
        let config = StationConfig::default();
        let record = WaterRecord {
            water_level: 1.0,
            is_fallback: false,
        };
        for _ in 0..10 {
            assert!(analyzer.analyze_water(1, &record, &config).is_none());
        }
    }

    #[test]
    fn long_term_classifies_slow_stable_displacement() {
        let analyzer = RiskAnalyzer::new();
        let config = StationConfig::default();

        let mut historical = Vec::new();
        let total_points = 10;
        for i in 0..total_points {
            let t = i as f64 * (30.0 * 86_400.0 / (total_points - 1) as f64);
            let frac = i as f64 / (total_points - 1) as f64;
            historical.push((
                t,
                serde_json::json!({ "pos_e": 0.1 * frac, "pos_n": 0.0, "pos_u": 0.0, "speed_2d": 0.0 }),
            ));
        }

        let result = analyzer.analyze_long_term(&historical, &config, 30);
        match result {
            LongTermResult::Success(analysis) => {
                assert_eq!(analysis.classification, "Very Slow");
                assert_eq!(analysis.trend, "stable");
                assert_eq!(analysis.risk_level, "LOW");
                assert!((analysis.velocity_mm_year - 1216.7).abs() < 1.0);
            }
            LongTermResult::InsufficientData { message } => {
                panic!("expected success, got insufficient_data: {message}")
            }
        }
    }

    #[test]
    fn insufficient_data_below_two_points() {
        let analyzer = RiskAnalyzer::new();
        let config = StationConfig::default();
        let result = analyzer.analyze_long_term(&[], &config, 30);
        assert!(matches!(result, LongTermResult::InsufficientData { .. }));
    }
}
