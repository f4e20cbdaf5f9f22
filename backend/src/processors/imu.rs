//! IMU processor — tri-axial acceleration and angular rate, with derived
//! roll/pitch and last-valid-value fallback on parse failure. Grounded on
//! `original_source/backend/processors/imu_processor.py::IMUEngine`.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct ImuRecord {
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub total_accel: f64,
}

pub struct ImuProcessor {
    last_valid: ImuRecord,
}

impl ImuProcessor {
    pub fn new() -> Self {
        Self {
            last_valid: ImuRecord {
                ax: 0.0,
                ay: 0.0,
                az: 9.8,
                gx: 0.0,
                gy: 0.0,
                gz: 0.0,
                roll: 0.0,
                pitch: 0.0,
                yaw: 0.0,
                total_accel: 9.8,
            },
        }
    }

    /// Accepts `ax/ay/az` or `accel_x/accel_y/accel_z`, `gx/gy/gz` or
    /// `gyro_x/gyro_y/gyro_z`, optional `roll/pitch/yaw`. A frame missing an
    /// axis silently carries forward that axis' last valid value rather than
    /// failing the whole frame.
    pub fn process(&mut self, payload: &Value) -> ImuRecord {
        let ax = field(payload, "ax", "accel_x").unwrap_or(self.last_valid.ax);
        let ay = field(payload, "ay", "accel_y").unwrap_or(self.last_valid.ay);
        let az = field(payload, "az", "accel_z").unwrap_or(self.last_valid.az);
        let gx = field(payload, "gx", "gyro_x").unwrap_or(self.last_valid.gx);
        let gy = field(payload, "gy", "gyro_y").unwrap_or(self.last_valid.gy);
        let gz = field(payload, "gz", "gyro_z").unwrap_or(self.last_valid.gz);

        let total_accel = (ax * ax + ay * ay + az * az).sqrt();

        let roll = match payload.get("roll").and_then(Value::as_f64) {
            Some(v) => v,
            None if total_accel > 0.0 => ay.atan2(az).to_degrees(),
            None => self.last_valid.roll,
        };
        let pitch = match payload.get("pitch").and_then(Value::as_f64) {
            Some(v) => v,
            None if total_accel > 0.0 => (-ax).atan2((ay * ay + az * az).sqrt()).to_degrees(),
            None => self.last_valid.pitch,
        };
        let yaw = payload
            .get("yaw")
            .and_then(Value::as_f64)
            .unwrap_or(self.last_valid.yaw);

        let record = ImuRecord {
            ax: round3(ax),
            ay: round3(ay),
            az: round3(az),
            gx: round3(gx),
            gy: round3(gy),
            gz: round3(gz),
            roll: round2(roll),
            pitch: round2(pitch),
            yaw: round2(yaw),
            total_accel: round3(total_accel),
        };
        self.last_valid = record.clone();
        record
    }
}

impl Default for ImuProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// `a.or(b).or(last)` extraction, preserved from the original processor: a
/// frame supplying neither alias carries the axis forward rather than
/// failing the whole sample.
fn field(payload: &Value, primary: &str, alias: &str) -> Option<f64> {
    payload
        .get(primary)
        .and_then(Value::as_f64)
        .or_else(|| payload.get(alias).and_then(Value::as_f64))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shock_reading_computes_total_accel() {
        let mut p = ImuProcessor::new();
        let r = p.process(&json!({"ax": 0.0, "ay": 0.0, "az": 25.0}));
        assert!((r.total_accel - 25.0).abs() < 1e-9);
    }

    #[test]
    fn accepts_aliased_axes() {
        let mut p = ImuProcessor::new();
        let r = p.process(&json!({"accel_x": 1.0, "accel_y": 2.0, "accel_z": 3.0}));
        assert_eq!(r.ax, 1.0);
        assert_eq!(r.ay, 2.0);
        assert_eq!(r.az, 3.0);
    }

    #[test]
    fn missing_axis_carries_forward() {
        let mut p = ImuProcessor::new();
        p.process(&json!({"ax": 1.0, "ay": 2.0, "az": 3.0}));
        let r = p.process(&json!({"ay": 5.0, "az": 3.0}));
        assert_eq!(r.ax, 1.0);
        assert_eq!(r.ay, 5.0);
    }

    #[test]
    fn derives_roll_pitch_when_absent() {
        let mut p = ImuProcessor::new();
        let r = p.process(&json!({"ax": 0.0, "ay": 0.0, "az": 9.8}));
        assert!((r.roll - 0.0).abs() < 1e-6);
        assert!((r.pitch - 0.0).abs() < 1e-6);
    }

    #[test]
    fn yaw_carries_forward_when_absent() {
        let mut p = ImuProcessor::new();
        p.process(&json!({"ax": 0.0, "ay": 0.0, "az": 9.8, "yaw": 45.0}));
        let r = p.process(&json!({"ax": 0.0, "ay": 0.0, "az": 9.8}));
        assert_eq!(r.yaw, 45.0);
    }
}
