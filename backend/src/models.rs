//! Core data model — persisted rows. Field lists per SPEC_FULL.md §3.
//! Ownership is one-way (parent holds no back-pointer); reverse lookups are
//! resolved through the Persistence Gateway with a query, per the
//! cyclic-ownership redesign guidance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: i64,
    pub project_code: String,
    pub name: String,
    pub description: Option<String>,
    pub location: Option<Value>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StationStatus {
    Online,
    Offline,
    Maintenance,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Station {
    pub id: i64,
    pub station_code: String,
    pub name: String,
    pub project_id: i64,
    pub location: Option<Value>,
    pub status: StationStatus,
    pub last_update: DateTime<Utc>,
    /// Raw station_config document, kept for forward-compatibility; the
    /// typed view (`state::StationConfig`) is parsed from this once per
    /// topic-registry reconciliation.
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Gnss,
    Rain,
    Water,
    Imu,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Gnss => "gnss",
            DeviceType::Rain => "rain",
            DeviceType::Water => "water",
            DeviceType::Imu => "imu",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub device_code: String,
    pub name: String,
    pub station_id: i64,
    pub device_type: DeviceType,
    /// Subscription topic; empty string means disabled.
    pub mqtt_topic: String,
    pub position: Option<Value>,
    pub is_active: bool,
    pub last_data_time: DateTime<Utc>,
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GnssOriginRow {
    pub id: i64,
    pub device_id: i64,
    pub lat: f64,
    pub lon: f64,
    pub h: f64,
    pub locked_at: DateTime<Utc>,
    pub spread_meters: Option<f64>,
    pub num_points: Option<i32>,
    /// 9 scalars, row-major.
    pub rotation_matrix: Option<Value>,
    /// 3 scalars.
    pub ecef_origin: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SensorDataRow {
    pub id: i64,
    pub station_id: i64,
    pub timestamp: DateTime<Utc>,
    pub sensor_type: String,
    pub data: Value,
    pub value_1: Option<f64>,
    pub value_2: Option<f64>,
    pub value_3: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertRow {
    pub id: i64,
    pub station_id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: AlertLevel,
    pub category: String,
    pub message: String,
    pub is_resolved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GlobalConfigRow {
    pub id: i64,
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<String>,
}
