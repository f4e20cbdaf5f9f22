//! Pipeline Orchestrator — binds a subscribed topic to {device, station,
//! processor, config} and drives raw frame → processor → analyzer →
//! persistence → broadcast. No per-frame error escapes `handle_frame`; every
//! failure is logged with device/station identity and the frame is dropped.
//! Grounded on the teacher's per-tick engine dispatch (`main.rs`'s 5 Hz loop
//! handing UWB packets to `procedure_engine`), generalized to one dispatch
//! per inbound frame instead of a fixed tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::analyzer::{Alert, RiskAnalyzer};
use crate::broadcast::BroadcastHub;
use crate::config::Settings;
use crate::crypto;
use crate::error::PipelineError;
use crate::models::{AlertLevel, DeviceType};
use crate::persistence::PersistenceGateway;
use crate::processors::gnss::GnssOutcome;
use crate::registry::{Binding, ProcessorSlot, TopicRegistry};

pub struct Orchestrator {
    registry: Arc<TopicRegistry>,
    analyzer: Arc<RiskAnalyzer>,
    persistence: Arc<PersistenceGateway>,
    broadcast: Arc<BroadcastHub>,
    settings: Arc<Settings>,
    last_write: StdMutex<HashMap<(i64, &'static str), Instant>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<TopicRegistry>,
        analyzer: Arc<RiskAnalyzer>,
        persistence: Arc<PersistenceGateway>,
        broadcast: Arc<BroadcastHub>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            registry,
            analyzer,
            persistence,
            broadcast,
            settings,
            last_write: StdMutex::new(HashMap::new()),
        }
    }

    /// Handles one raw broker frame. Never panics or propagates a frame-level
    /// error to the caller; every failure path logs and returns.
    pub async fn handle_frame(&self, topic: &str, payload: &[u8]) {
        let Some(binding) = self.registry.lookup(topic).await else {
            let err = PipelineError::UnknownTopic(topic.to_string());
            debug!(topic, %err, "dropping frame");
            return;
        };

        let text = match std::str::from_utf8(payload) {
            Ok(s) => s,
            Err(_) => {
                let err = PipelineError::UndecodablePayload;
                warn!(topic, device_id = binding.device_id, %err, "dropping frame");
                return;
            }
        };

        let decoded = if crypto::is_plaintext(text.as_bytes()) {
            text.to_string()
        } else {
            match crypto::decrypt_aes(text, &self.settings.aes_key, &self.settings.aes_iv) {
                Ok(plain) => plain,
                Err(source) => {
                    let err = PipelineError::UndecodablePayload;
                    warn!(topic, device_id = binding.device_id, %err, source = ?source, "dropping frame");
                    return;
                }
            }
        };

        match binding.device_type {
            DeviceType::Gnss => self.handle_gnss(&binding, &decoded).await,
            DeviceType::Rain | DeviceType::Water | DeviceType::Imu => {
                let json = match serde_json::from_str::<Value>(&decoded) {
                    Ok(v) => v,
                    Err(source) => {
                        let err = PipelineError::MalformedFrame(source.to_string());
                        warn!(topic, device_id = binding.device_id, %err, "dropping frame");
                        return;
                    }
                };
                self.handle_json(&binding, &json).await;
            }
        }
    }

    async fn handle_gnss(&self, binding: &Binding, frame: &str) {
        let ProcessorSlot::Gnss(processor) = binding.processor.as_ref() else {
            warn!(device_id = binding.device_id, "binding type mismatch, expected GNSS processor");
            return;
        };

        let outcome = {
            let mut processor = processor.lock().await;
            processor.process(frame, Utc::now()).await
        };

        match outcome {
            GnssOutcome::Dropped => {}
            GnssOutcome::WaitingForQuality { message }
            | GnssOutcome::OriginReset { message } => {
                self.broadcast.emit_sensor_data(
                    binding.station_id,
                    "gnss",
                    Utc::now().timestamp(),
                    serde_json::json!({ "status": "calibrating", "message": message }),
                );
                self.persist_heartbeat_and_status(binding).await;
            }
            GnssOutcome::OriginCollecting { count, target } => {
                self.broadcast.emit_sensor_data(
                    binding.station_id,
                    "gnss",
                    Utc::now().timestamp(),
                    serde_json::json!({ "status": "origin_collecting", "count": count, "target": target }),
                );
                self.persist_heartbeat_and_status(binding).await;
            }
            GnssOutcome::OriginLocked { lat, lon, h, spread_meters, num_points } => {
                self.broadcast.emit_sensor_data(
                    binding.station_id,
                    "gnss",
                    Utc::now().timestamp(),
                    serde_json::json!({
                        "status": "origin_locked",
                        "lat": lat, "lon": lon, "h": h,
                        "spread_meters": spread_meters, "num_points": num_points,
                    }),
                );
                self.persist_heartbeat_and_status(binding).await;
            }
            GnssOutcome::Processed(record) => {
                let data = serde_json::to_value(&record).unwrap_or(Value::Null);
                self.broadcast.emit_sensor_data(binding.station_id, "gnss", record.timestamp.timestamp(), data.clone());

                let alert = self.analyzer.analyze_gnss(binding.station_id, &record, &binding.config);
                self.emit_station_status(binding.station_id, &alert);
                self.persist_heartbeat_and_status(binding).await;
                self.persist_sample(
                    binding,
                    "gnss",
                    data,
                    Some(record.speed_2d),
                    Some(record.total_displacement_mm),
                    None,
                    &alert,
                )
                .await;
            }
        }
    }

    async fn handle_json(&self, binding: &Binding, frame: &Value) {
        match binding.processor.as_ref() {
            ProcessorSlot::Rain(processor) => {
                let now_secs = Utc::now().timestamp() as f64;
                let record = processor.lock().await.process(frame, now_secs);
                let data = serde_json::to_value(&record).unwrap_or(Value::Null);
                self.broadcast.emit_sensor_data(binding.station_id, "rain", Utc::now().timestamp(), data.clone());

                let alert = self.analyzer.analyze_rain(binding.station_id, &record, &binding.config);
                self.emit_station_status(binding.station_id, &alert);
                self.persist_heartbeat_and_status(binding).await;
                self.persist_sample(
                    binding,
                    "rain",
                    data,
                    Some(record.rainfall_mm),
                    Some(record.intensity_mm_h),
                    None,
                    &alert,
                )
                .await;
            }
            ProcessorSlot::Water(processor) => {
                let now_secs = Utc::now().timestamp() as f64;
                let record = processor.lock().await.process(frame, now_secs);
                let data = serde_json::to_value(&record).unwrap_or(Value::Null);
                self.broadcast.emit_sensor_data(binding.station_id, "water", Utc::now().timestamp(), data.clone());

                let alert = self.analyzer.analyze_water(binding.station_id, &record, &binding.config);
                self.emit_station_status(binding.station_id, &alert);
                self.persist_heartbeat_and_status(binding).await;
                self.persist_sample(binding, "water", data, Some(record.water_level), None, None, &alert)
                    .await;
            }
            ProcessorSlot::Imu(processor) => {
                let record = processor.lock().await.process(frame);
                let data = serde_json::to_value(&record).unwrap_or(Value::Null);
                self.broadcast.emit_sensor_data(binding.station_id, "imu", Utc::now().timestamp(), data.clone());

                let alert = self.analyzer.analyze_imu(binding.station_id, &record, &binding.config);
                self.emit_station_status(binding.station_id, &alert);
                self.persist_heartbeat_and_status(binding).await;
                self.persist_sample(binding, "imu", data, Some(record.total_accel), None, None, &alert)
                    .await;
            }
            ProcessorSlot::Gnss(_) => {
                warn!(device_id = binding.device_id, "binding type mismatch, expected JSON processor");
            }
        }
    }

    fn emit_station_status(&self, station_id: i64, alert: &Option<Alert>) {
        let risk_level = match alert {
            Some(alert) => match alert.level {
                AlertLevel::Warning => "WARNING",
                AlertLevel::Critical => "CRITICAL",
            },
            None => "LOW",
        };
        self.broadcast.emit_station_status(station_id, risk_level);
        if let Some(alert) = alert {
            self.broadcast.emit_alert(
                station_id,
                match alert.level {
                    AlertLevel::Warning => "WARNING",
                    AlertLevel::Critical => "CRITICAL",
                },
                alert.category,
                &alert.message,
            );
        }
    }

    async fn persist_heartbeat_and_status(&self, binding: &Binding) {
        if let Err(source) = self.persistence.update_device_heartbeat(binding.device_id).await {
            let err = PipelineError::Persistence(source);
            warn!(device_id = binding.device_id, %err, "failed to update device heartbeat");
        }
        if let Err(source) = self.persistence.mark_station_online(binding.station_id).await {
            let err = PipelineError::Persistence(source);
            warn!(station_id = binding.station_id, %err, "failed to mark station online");
        }
    }

    /// Writes a Sensor Data Record when an alert fired or the per-type save
    /// interval has elapsed since the last write for this device; always
    /// writes an Alert Record when an alert fired.
    #[allow(clippy::too_many_arguments)]
    async fn persist_sample(
        &self,
        binding: &Binding,
        sensor_type: &'static str,
        data: Value,
        value_1: Option<f64>,
        value_2: Option<f64>,
        value_3: Option<f64>,
        alert: &Option<Alert>,
    ) {
        let should_write = alert.is_some() || self.save_interval_elapsed(binding.device_id, sensor_type);

        if should_write {
            if let Err(source) = self
                .persistence
                .insert_sensor_data(binding.station_id, sensor_type, data, value_1, value_2, value_3)
                .await
            {
                let err = PipelineError::Persistence(source);
                warn!(station_id = binding.station_id, sensor_type, %err, "failed to insert sensor data");
            }
            self.last_write
                .lock()
                .unwrap()
                .insert((binding.device_id, sensor_type), Instant::now());
        }

        if let Some(alert) = alert {
            if let Err(source) = self
                .persistence
                .insert_alert(binding.station_id, alert.level, alert.category, &alert.message)
                .await
            {
                let err = PipelineError::Persistence(source);
                warn!(station_id = binding.station_id, %err, "failed to insert alert");
            }
        }
    }

    fn save_interval_elapsed(&self, device_id: i64, sensor_type: &'static str) -> bool {
        let interval = self.settings.save_interval_for(sensor_type);
        let mut last_write = self.last_write.lock().unwrap();
        match last_write.get(&(device_id, sensor_type)) {
            Some(last) => last.elapsed() >= interval,
            None => true,
        }
    }
}
