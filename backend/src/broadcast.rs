//! Broadcast Hub — fan-out of typed live events to connected observers, with
//! per-event-kind throttling. Grounded on
//! `original_source/backend/app/websocket.py::ConnectionManager` for the
//! connect/disconnect/drop-on-failure shape; throttling is a net-new addition
//! per SPEC_FULL.md §4.7 (the original has none).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

const STATION_STATUS_MIN_INTERVAL: Duration = Duration::from_millis(500);
const SENSOR_DATA_MIN_INTERVAL: Duration = Duration::from_millis(100);

pub type ObserverId = u64;

/// Fan-out target: a channel into one connected observer's outbound socket
/// task. Observers are removed from the set the first time a send fails.
pub struct BroadcastHub {
    next_id: AtomicU64,
    observers: Mutex<HashMap<ObserverId, mpsc::UnboundedSender<String>>>,
    station_status_last: Mutex<HashMap<i64, Instant>>,
    sensor_data_last: Mutex<HashMap<(i64, String), Instant>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            observers: Mutex::new(HashMap::new()),
            station_status_last: Mutex::new(HashMap::new()),
            sensor_data_last: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new observer and returns its id plus the receiving half of
    /// its outbound channel — the caller owns forwarding that channel to the
    /// actual websocket.
    pub fn connect(&self) -> (ObserverId, mpsc::UnboundedReceiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.lock().unwrap().insert(id, tx);
        debug!(observer_id = id, "observer connected");
        (id, rx)
    }

    pub fn disconnect(&self, id: ObserverId) {
        self.observers.lock().unwrap().remove(&id);
        debug!(observer_id = id, "observer disconnected");
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    /// Delivers to every observer currently in the set; an observer whose
    /// send fails (channel closed) is dropped from the set immediately. No
    /// per-observer buffering — this is an attempt at dispatch time only.
    fn send_to_all(&self, message: &Value) {
        let payload = message.to_string();
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|_, tx| tx.send(payload.clone()).is_ok());
    }

    pub fn emit_sensor_data(&self, station_id: i64, sensor_type: &str, timestamp: i64, data: Value) {
        let key = (station_id, sensor_type.to_string());
        let now = Instant::now();
        {
            let mut last = self.sensor_data_last.lock().unwrap();
            if let Some(prev) = last.get(&key) {
                if now.duration_since(*prev) < SENSOR_DATA_MIN_INTERVAL {
                    return;
                }
            }
            last.insert(key, now);
        }
        self.send_to_all(&json!({
            "type": "sensor_data",
            "station_id": station_id,
            "sensor_type": sensor_type,
            "timestamp": timestamp,
            "data": data,
        }));
    }

    pub fn emit_station_status(&self, station_id: i64, risk_level: &str) {
        let now = Instant::now();
        {
            let mut last = self.station_status_last.lock().unwrap();
            if let Some(prev) = last.get(&station_id) {
                if now.duration_since(*prev) < STATION_STATUS_MIN_INTERVAL {
                    return;
                }
            }
            last.insert(station_id, now);
        }
        self.send_to_all(&json!({
            "type": "station_status",
            "station_id": station_id,
            "risk_level": risk_level,
        }));
    }

    /// Alerts bypass throttling entirely, per spec.
    pub fn emit_alert(&self, station_id: i64, level: &str, category: &str, message: &str) {
        self.send_to_all(&json!({
            "type": "alert",
            "station_id": station_id,
            "level": level,
            "category": category,
            "message": message,
        }));
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_data_throttles_within_window() {
        let hub = BroadcastHub::new();
        let (_id, mut rx) = hub.connect();
        hub.emit_sensor_data(1, "gnss", 0, json!({}));
        hub.emit_sensor_data(1, "gnss", 0, json!({}));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sensor_data_does_not_throttle_across_stations() {
        let hub = BroadcastHub::new();
        let (_id, mut rx) = hub.connect();
        hub.emit_sensor_data(1, "gnss", 0, json!({}));
        hub.emit_sensor_data(2, "gnss", 0, json!({}));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn alert_always_sends() {
        let hub = BroadcastHub::new();
        let (_id, mut rx) = hub.connect();
        for _ in 0..5 {
            hub.emit_alert(1, "CRITICAL", "shock", "shock detected");
        }
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 5);
    }

    #[test]
    fn disconnect_removes_observer() {
        let hub = BroadcastHub::new();
        let (id, _rx) = hub.connect();
        assert_eq!(hub.observer_count(), 1);
        hub.disconnect(id);
        assert_eq!(hub.observer_count(), 0);
    }

    #[test]
    fn dropped_receiver_is_pruned_on_next_send() {
        let hub = BroadcastHub::new();
        let (_id, rx) = hub.connect();
        drop(rx);
        assert_eq!(hub.observer_count(), 1);
        hub.emit_alert(1, "WARNING", "rainfall", "heavy rain");
        assert_eq!(hub.observer_count(), 0);
    }
}
