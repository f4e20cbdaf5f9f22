//! Rain-gauge processor — cumulative rainfall plus derived intensity.
//! Grounded on `original_source/backend/processors/water_processor.py::RainEngine`.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;

const HISTORY_CAPACITY: usize = 60;

#[derive(Debug, Clone, Serialize)]
pub struct RainRecord {
    pub rainfall_mm: f64,
    pub intensity_mm_h: f64,
    pub is_fallback: bool,
}

pub struct RainProcessor {
    history: VecDeque<(f64, f64)>,
    last_valid_rainfall: f64,
    last_valid_intensity: f64,
}

impl RainProcessor {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            last_valid_rainfall: 0.0,
            last_valid_intensity: 0.0,
        }
    }

    /// Processes one JSON frame (`rainfall_mm` cumulative, optional
    /// `intensity_mm_h`). When intensity isn't supplied, derives it from
    /// `Δrainfall/Δt` guarded by `0 < Δt < 3600`; a negative delta (gauge
    /// reset) yields intensity 0.
    pub fn process(&mut self, payload: &Value, now_secs: f64) -> RainRecord {
        let Some(rainfall_mm) = payload.get("rainfall_mm").and_then(Value::as_f64) else {
            return self.fallback();
        };

        let intensity_mm_h = match payload.get("intensity_mm_h").and_then(Value::as_f64) {
            Some(supplied) => supplied,
            None => self.derive_intensity(rainfall_mm, now_secs),
        };

        self.last_valid_rainfall = rainfall_mm;
        self.last_valid_intensity = intensity_mm_h;
        self.history.push_back((now_secs, rainfall_mm));
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }

        RainRecord {
            rainfall_mm: round2(rainfall_mm),
            intensity_mm_h: round2(intensity_mm_h),
            is_fallback: false,
        }
    }

    fn derive_intensity(&self, rainfall_mm: f64, now_secs: f64) -> f64 {
        let Some(&(prev_time, prev_rainfall)) = self.history.back() else {
            return 0.0;
        };
        let dt = now_secs - prev_time;
        let delta = rainfall_mm - prev_rainfall;
        if dt > 0.0 && dt < 3600.0 && delta >= 0.0 {
            (delta / dt) * 3600.0
        } else {
            0.0
        }
    }

    fn fallback(&self) -> RainRecord {
        RainRecord {
            rainfall_mm: round2(self.last_valid_rainfall),
            intensity_mm_h: round2(self.last_valid_intensity),
            is_fallback: true,
        }
    }
}

impl Default for RainProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derives_intensity_from_delta() {
        let mut p = RainProcessor::new();
        p.process(&json!({"rainfall_mm": 10.0}), 0.0);
        let r = p.process(&json!({"rainfall_mm": 15.0}), 1800.0);
        assert_eq!(r.intensity_mm_h, 10.0);
        assert!(!r.is_fallback);
    }

    #[test]
    fn supplied_intensity_is_preserved() {
        let mut p = RainProcessor::new();
        let r = p.process(&json!({"rainfall_mm": 1.0, "intensity_mm_h": 42.5}), 0.0);
        assert_eq!(r.intensity_mm_h, 42.5);
    }

    #[test]
    fn negative_delta_treated_as_gauge_reset() {
        let mut p = RainProcessor::new();
        p.process(&json!({"rainfall_mm": 20.0}), 0.0);
        let r = p.process(&json!({"rainfall_mm": 2.0}), 60.0);
        assert_eq!(r.intensity_mm_h, 0.0);
    }

    #[test]
    fn missing_rainfall_falls_back() {
        let mut p = RainProcessor::new();
        p.process(&json!({"rainfall_mm": 5.0}), 0.0);
        let r = p.process(&json!({}), 60.0);
        assert_eq!(r.rainfall_mm, 5.0);
        assert!(r.is_fallback);
    }
}
