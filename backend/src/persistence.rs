//! Persistence Gateway — write-through to three logical stores (auth,
//! config, data) with separate connection pools. Every write acquires a
//! pooled connection inside a transaction, commits on success, and lets
//! `sqlx`'s transaction guard roll back on any error path (including early
//! returns via `?`) — no manual rollback calls.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, warn};

use crate::models::{AlertLevel, Device, GnssOriginRow, Station};

#[derive(Clone)]
pub struct PersistenceGateway {
    auth_pool: PgPool,
    config_pool: PgPool,
    data_pool: PgPool,
}

impl PersistenceGateway {
    /// Opens all three pools. A failure here is fatal — the caller aborts
    /// startup with the returned diagnostic, per the error handling design.
    pub async fn connect(
        auth_url: &str,
        config_url: &str,
        data_url: &str,
    ) -> Result<Self, sqlx::Error> {
        let auth_pool = PgPoolOptions::new().max_connections(5).connect(auth_url).await?;
        let config_pool = PgPoolOptions::new().max_connections(5).connect(config_url).await?;
        let data_pool = PgPoolOptions::new().max_connections(10).connect(data_url).await?;
        Ok(Self {
            auth_pool,
            config_pool,
            data_pool,
        })
    }

    // ── Reads used by the Topic Registry ──────────────────────────────────

    /// All devices with `is_active = true`, joined to their owning station.
    pub async fn list_active_devices(&self) -> Result<Vec<(Device, Station)>, sqlx::Error> {
        let devices = sqlx::query_as::<_, Device>(
            "SELECT id, device_code, name, station_id, device_type, mqtt_topic, \
             position, is_active, last_data_time, config, created_at, updated_at \
             FROM devices WHERE is_active = true",
        )
        .fetch_all(&self.config_pool)
        .await?;

        let mut out = Vec::with_capacity(devices.len());
        for device in devices {
            let station = sqlx::query_as::<_, Station>(
                "SELECT id, station_code, name, project_id, location, status, \
                 last_update, config, created_at, updated_at FROM stations WHERE id = $1",
            )
            .bind(device.station_id)
            .fetch_optional(&self.config_pool)
            .await?;

            match station {
                Some(station) => out.push((device, station)),
                None => warn!(
                    device_id = device.id,
                    station_id = device.station_id,
                    "active device references missing station, skipping"
                ),
            }
        }
        Ok(out)
    }

    // ── GNSS origin read/write ─────────────────────────────────────────────

    pub async fn load_gnss_origin(&self, device_id: i64) -> Result<Option<GnssOriginRow>, sqlx::Error> {
        sqlx::query_as::<_, GnssOriginRow>(
            "SELECT id, device_id, lat, lon, h, locked_at, spread_meters, num_points, \
             rotation_matrix, ecef_origin FROM gnss_origins WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.config_pool)
        .await
    }

    /// Upsert by `device_id` — exactly-once semantics when a processor locks
    /// an origin and retries on the next opportunity if the write fails.
    pub async fn save_gnss_origin(
        &self,
        device_id: i64,
        lat: f64,
        lon: f64,
        h: f64,
        spread_meters: f64,
        num_points: i32,
        rotation_matrix: [f64; 9],
        ecef_origin: [f64; 3],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.config_pool.begin().await?;
        sqlx::query(
            "INSERT INTO gnss_origins \
             (device_id, lat, lon, h, locked_at, spread_meters, num_points, rotation_matrix, ecef_origin) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (device_id) DO UPDATE SET \
               lat = EXCLUDED.lat, lon = EXCLUDED.lon, h = EXCLUDED.h, \
               locked_at = EXCLUDED.locked_at, spread_meters = EXCLUDED.spread_meters, \
               num_points = EXCLUDED.num_points, rotation_matrix = EXCLUDED.rotation_matrix, \
               ecef_origin = EXCLUDED.ecef_origin",
        )
        .bind(device_id)
        .bind(lat)
        .bind(lon)
        .bind(h)
        .bind(Utc::now())
        .bind(spread_meters)
        .bind(num_points)
        .bind(json!(rotation_matrix))
        .bind(json!(ecef_origin))
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    // ── Writes used by the Pipeline Orchestrator ───────────────────────────

    pub async fn update_device_heartbeat(&self, device_id: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.config_pool.begin().await?;
        sqlx::query("UPDATE devices SET last_data_time = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(device_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    pub async fn mark_station_online(&self, station_id: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.config_pool.begin().await?;
        sqlx::query("UPDATE stations SET last_update = $1, status = 'online' WHERE id = $2")
            .bind(Utc::now())
            .bind(station_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    pub async fn insert_sensor_data(
        &self,
        station_id: i64,
        sensor_type: &str,
        data: serde_json::Value,
        value_1: Option<f64>,
        value_2: Option<f64>,
        value_3: Option<f64>,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.data_pool.begin().await?;
        sqlx::query(
            "INSERT INTO sensor_data (station_id, timestamp, sensor_type, data, value_1, value_2, value_3) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(station_id)
        .bind(Utc::now())
        .bind(sensor_type)
        .bind(data)
        .bind(value_1)
        .bind(value_2)
        .bind(value_3)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    pub async fn insert_alert(
        &self,
        station_id: i64,
        level: AlertLevel,
        category: &str,
        message: &str,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.data_pool.begin().await?;
        sqlx::query(
            "INSERT INTO alerts (station_id, timestamp, level, category, message, is_resolved) \
             VALUES ($1, $2, $3, $4, $5, false)",
        )
        .bind(station_id)
        .bind(Utc::now())
        .bind(level)
        .bind(category)
        .bind(message)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    /// Historical sensor rows for one station/sensor type, used by long-term analysis.
    pub async fn recent_sensor_data(
        &self,
        station_id: i64,
        sensor_type: &str,
        since: chrono::DateTime<Utc>,
    ) -> Result<Vec<crate::models::SensorDataRow>, sqlx::Error> {
        sqlx::query_as::<_, crate::models::SensorDataRow>(
            "SELECT id, station_id, timestamp, sensor_type, data, value_1, value_2, value_3 \
             FROM sensor_data WHERE station_id = $1 AND sensor_type = $2 AND timestamp >= $3 \
             ORDER BY timestamp ASC",
        )
        .bind(station_id)
        .bind(sensor_type)
        .bind(since)
        .fetch_all(&self.data_pool)
        .await
    }
}

/// Narrow interface the GNSS processor depends on — lets it load/save its
/// calibration without pulling in the full gateway surface or the concrete
/// `sqlx` type, and makes the processor trivially testable with a fake store.
#[async_trait]
pub trait GnssOriginStore: Send + Sync {
    async fn load_gnss_origin(&self, device_id: i64) -> Option<GnssOriginRow>;
    async fn save_gnss_origin(
        &self,
        device_id: i64,
        lat: f64,
        lon: f64,
        h: f64,
        spread_meters: f64,
        num_points: i32,
        rotation_matrix: [f64; 9],
        ecef_origin: [f64; 3],
    );
}

#[async_trait]
impl GnssOriginStore for PersistenceGateway {
    async fn load_gnss_origin(&self, device_id: i64) -> Option<GnssOriginRow> {
        match PersistenceGateway::load_gnss_origin(self, device_id).await {
            Ok(row) => row,
            Err(e) => {
                error!(device_id, error = %e, "failed to load GNSS origin");
                None
            }
        }
    }

    async fn save_gnss_origin(
        &self,
        device_id: i64,
        lat: f64,
        lon: f64,
        h: f64,
        spread_meters: f64,
        num_points: i32,
        rotation_matrix: [f64; 9],
        ecef_origin: [f64; 3],
    ) {
        if let Err(e) = PersistenceGateway::save_gnss_origin(
            self,
            device_id,
            lat,
            lon,
            h,
            spread_meters,
            num_points,
            rotation_matrix,
            ecef_origin,
        )
        .await
        {
            // The in-memory origin remains valid; the next lock attempt
            // (or an explicit reset) retries the write.
            error!(device_id, error = %e, "failed to save GNSS origin, keeping in-memory origin");
        }
    }
}
