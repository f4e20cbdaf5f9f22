//! Water-level processor — "last-valid-value + fallback" pattern. Grounded on
//! `original_source/backend/processors/water_processor.py::WaterEngine`.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;

use crate::state::WaterRangeConfig;

const HISTORY_CAPACITY: usize = 36;

#[derive(Debug, Clone, Serialize)]
pub struct WaterRecord {
    pub water_level: f64,
    pub is_fallback: bool,
}

pub struct WaterProcessor {
    range: WaterRangeConfig,
    history: VecDeque<(f64, f64)>,
    last_valid_value: f64,
}

impl WaterProcessor {
    pub fn new(range: WaterRangeConfig) -> Self {
        Self {
            range,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            last_valid_value: 0.0,
        }
    }

    /// Processes one JSON frame (`value` or `water_level`, meters). Never
    /// drops a sample — out-of-range or missing input falls back to the last
    /// valid value with `is_fallback = true`.
    pub fn process(&mut self, payload: &Value, now_secs: f64) -> WaterRecord {
        let raw = payload
            .get("value")
            .or_else(|| payload.get("water_level"))
            .and_then(Value::as_f64);

        let Some(value_meters) = raw else {
            return self.fallback();
        };

        if !(self.range.valid_min..=self.range.valid_max).contains(&value_meters) {
            return self.fallback();
        }

        self.last_valid_value = value_meters;
        self.history.push_back((now_secs, value_meters));
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }

        WaterRecord {
            water_level: round3(value_meters),
            is_fallback: false,
        }
    }

    fn fallback(&self) -> WaterRecord {
        WaterRecord {
            water_level: round3(self.last_valid_value),
            is_fallback: true,
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_reading_updates_last_value() {
        let mut p = WaterProcessor::new(WaterRangeConfig::default());
        let r = p.process(&json!({"value": 1.234}), 0.0);
        assert_eq!(r.water_level, 1.234);
        assert!(!r.is_fallback);
    }

    #[test]
    fn out_of_range_falls_back_to_last_valid() {
        let mut p = WaterProcessor::new(WaterRangeConfig::default());
        p.process(&json!({"value": 2.0}), 0.0);
        let r = p.process(&json!({"value": 999.0}), 1.0);
        assert_eq!(r.water_level, 2.0);
        assert!(r.is_fallback);
    }

    #[test]
    fn missing_value_falls_back() {
        let mut p = WaterProcessor::new(WaterRangeConfig::default());
        p.process(&json!({"value": 3.5}), 0.0);
        let r = p.process(&json!({}), 1.0);
        assert_eq!(r.water_level, 3.5);
        assert!(r.is_fallback);
    }

    #[test]
    fn accepts_water_level_alias() {
        let mut p = WaterProcessor::new(WaterRangeConfig::default());
        let r = p.process(&json!({"water_level": 0.5}), 0.0);
        assert_eq!(r.water_level, 0.5);
    }
}
