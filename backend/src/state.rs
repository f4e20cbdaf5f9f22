//! Typed configuration view and shared runtime state types.
//!
//! `station_config` documents are deeply-nested JSON in the original system.
//! Per the redesign guidance, we parse them once — at Topic Registry
//! reconciliation time — into a typed `StationConfig` with defaulted
//! accessors, and hand an `Arc<StationConfig>` down to processors and the
//! analyzer. The raw JSON stays on the `Station` row for forward
//! compatibility.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VelocityUnit {
    #[serde(rename = "mm/s")]
    MmPerSec,
    #[serde(rename = "mm/day")]
    MmPerDay,
    #[serde(rename = "mm/year")]
    MmPerYear,
    #[serde(rename = "m/s")]
    MPerSec,
}

impl VelocityUnit {
    /// Converts a threshold expressed in this unit to mm/s.
    pub fn to_mm_per_sec(self, value: f64) -> f64 {
        match self {
            VelocityUnit::MmPerSec => value,
            VelocityUnit::MmPerDay => value / 86_400.0,
            VelocityUnit::MmPerYear => value / 31_536_000.0,
            VelocityUnit::MPerSec => value * 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityClass {
    pub name: String,
    pub threshold: f64,
    pub unit: VelocityUnit,
}

/// The default seven-tier classification table, per
/// `original_source/backend/app/landslide_analyzer.py::_classify_velocity_extended`.
pub fn default_classification_table() -> Vec<VelocityClass> {
    vec![
        cls("Extremely Rapid", 5000.0, VelocityUnit::MmPerSec),
        cls("Very Rapid", 50.0, VelocityUnit::MmPerSec),
        cls("Rapid", 0.5, VelocityUnit::MmPerSec),
        cls("Moderate", 0.05, VelocityUnit::MmPerSec),
        cls("Slow", 0.00005, VelocityUnit::MmPerSec),
        cls("Very Slow", 0.0000005, VelocityUnit::MmPerSec),
        cls("Extremely Slow", 0.0, VelocityUnit::MmPerSec),
    ]
}

fn cls(name: &str, threshold: f64, unit: VelocityUnit) -> VelocityClass {
    VelocityClass {
        name: name.to_string(),
        threshold,
        unit,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GnssAlertingConfig {
    pub gnss_confirm_steps: u32,
    /// Parsed for forward compatibility; the shipped debounce logic uses
    /// decrement-to-zero instead of a streak counter, matching the
    /// original's own unused field (see DESIGN.md).
    pub gnss_safe_streak: u32,
}

impl Default for GnssAlertingConfig {
    fn default() -> Self {
        Self {
            gnss_confirm_steps: 3,
            gnss_safe_streak: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RainAlertingConfig {
    pub rain_intensity_watch_threshold: f64,
    pub rain_intensity_warning_threshold: f64,
    pub rain_intensity_critical_threshold: f64,
    pub rain_confirm_steps: u32,
}

impl Default for RainAlertingConfig {
    fn default() -> Self {
        Self {
            rain_intensity_watch_threshold: 10.0,
            rain_intensity_warning_threshold: 25.0,
            rain_intensity_critical_threshold: 50.0,
            rain_confirm_steps: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterAlertingConfig {
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub water_confirm_steps: u32,
}

impl Default for WaterAlertingConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 999.0,
            critical_threshold: 999.0,
            water_confirm_steps: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImuAlertingConfig {
    pub shock_threshold_ms2: f64,
    pub imu_confirm_steps: u32,
}

impl Default for ImuAlertingConfig {
    fn default() -> Self {
        Self {
            shock_threshold_ms2: 20.0,
            imu_confirm_steps: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterRangeConfig {
    pub valid_min: f64,
    pub valid_max: f64,
}

impl Default for WaterRangeConfig {
    fn default() -> Self {
        Self {
            valid_min: 0.0,
            valid_max: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GnssCalibrationConfig {
    pub required_points: usize,
    pub max_spread_m: f64,
    pub filter_window_size: usize,
    pub min_fix_quality: u8,
}

impl Default for GnssCalibrationConfig {
    fn default() -> Self {
        Self {
            required_points: 5,
            max_spread_m: 5.0,
            filter_window_size: 5,
            min_fix_quality: 4,
        }
    }
}

/// The validated, defaulted view of a station's `config` JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default = "default_classification_table")]
    pub velocity_classification: Vec<VelocityClass>,
    #[serde(default)]
    pub gnss_alerting: GnssAlertingConfig,
    #[serde(default)]
    pub rain_alerting: RainAlertingConfig,
    #[serde(default)]
    pub water_alerting: WaterAlertingConfig,
    #[serde(default)]
    pub imu_alerting: ImuAlertingConfig,
    #[serde(default)]
    pub water_range: WaterRangeConfig,
    #[serde(default)]
    pub gnss_calibration: GnssCalibrationConfig,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            velocity_classification: default_classification_table(),
            gnss_alerting: GnssAlertingConfig::default(),
            rain_alerting: RainAlertingConfig::default(),
            water_alerting: WaterAlertingConfig::default(),
            imu_alerting: ImuAlertingConfig::default(),
            water_range: WaterRangeConfig::default(),
            gnss_calibration: GnssCalibrationConfig::default(),
        }
    }
}

impl StationConfig {
    /// Parses a raw `station.config` JSON document, falling back to field
    /// defaults for anything missing or malformed. Never fails — an
    /// unparseable document yields the all-default config.
    pub fn from_raw(raw: &serde_json::Value) -> Self {
        serde_json::from_value(raw.clone()).unwrap_or_default()
    }
}
