//! GNSS Processor — converts a stream of GNGGA-style NMEA frames into a
//! stream of calibrated displacement/velocity records in a local east-north-up
//! frame, using a station-local origin learned from an initial burst of fixes.
//! Grounded on `original_source/backend/processors/gnss_processor.py`; math
//! contracts live in [`crate::geo`].

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::geo::{self, Mat3, Vec3};
use crate::persistence::GnssOriginStore;
use crate::state::GnssCalibrationConfig;

#[derive(Debug, Clone, Copy)]
struct WgsPoint {
    lat: f64,
    lon: f64,
    h: f64,
}

struct ParsedFrame {
    wgs: WgsPoint,
    fix_quality: u8,
    num_sats: u32,
    hdop: f64,
}

/// A locked, calibrated station-local origin.
#[derive(Debug, Clone)]
pub struct Origin {
    pub lat: f64,
    pub lon: f64,
    pub h: f64,
    pub rotation: Mat3,
    pub ecef: Vec3,
}

impl Origin {
    fn from_centroid(lat: f64, lon: f64, h: f64) -> Self {
        Self {
            lat,
            lon,
            h,
            rotation: geo::rotation(lat, lon),
            ecef: geo::ecef(lat, lon, h),
        }
    }

    /// Reconstructs an origin from a persisted row. A row with a missing or
    /// malformed rotation matrix or ECEF origin is treated as absent.
    fn from_row(row: &crate::models::GnssOriginRow) -> Option<Self> {
        let rotation_flat: Vec<f64> =
            serde_json::from_value(row.rotation_matrix.clone()?).ok()?;
        let ecef_flat: Vec<f64> = serde_json::from_value(row.ecef_origin.clone()?).ok()?;
        if rotation_flat.len() != 9 || ecef_flat.len() != 3 {
            return None;
        }
        let rotation: Mat3 = [
            [rotation_flat[0], rotation_flat[1], rotation_flat[2]],
            [rotation_flat[3], rotation_flat[4], rotation_flat[5]],
            [rotation_flat[6], rotation_flat[7], rotation_flat[8]],
        ];
        let ecef: Vec3 = [ecef_flat[0], ecef_flat[1], ecef_flat[2]];
        Some(Self {
            lat: row.lat,
            lon: row.lon,
            h: row.h,
            rotation,
            ecef,
        })
    }
}

struct HistPoint {
    ts: f64,
    ecef: Vec3,
}

enum State {
    AwaitingCandidates { candidates: Vec<WgsPoint> },
    OriginLocked(Origin),
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct GnssStats {
    pub total_processed: u64,
    pub low_quality_rejected: u64,
    pub origin_resets: u64,
}

/// Result of the asynchronous startup origin load: `None` while in flight,
/// `Some(None)` when the load completed and found nothing usable.
enum LoadSlot {
    Pending,
    Done(Option<Origin>),
}

/// One processed GNSS sample.
#[derive(Debug, Clone, Serialize)]
pub struct GnssRecord {
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub h: f64,
    pub pos_e: f64,
    pub pos_n: f64,
    pub pos_u: f64,
    pub total_displacement_mm: f64,
    pub vel_e: f64,
    pub vel_n: f64,
    pub vel_u: f64,
    pub speed_2d: f64,
    pub speed_2d_mm_s: f64,
    pub fix_quality: u8,
    pub num_sats: u32,
    pub hdop: f64,
}

#[derive(Debug, Clone, Serialize)]
pub enum GnssOutcome {
    /// Frame failed to parse, or fix quality too low while already locked.
    Dropped,
    WaitingForQuality { message: String },
    OriginCollecting { count: usize, target: usize },
    OriginLocked {
        lat: f64,
        lon: f64,
        h: f64,
        spread_meters: f64,
        num_points: usize,
    },
    OriginReset { message: String },
    Processed(GnssRecord),
}

/// Stateful per-device GNSS transform. Owned exclusively by the task handling
/// this device (per the actor-like redesign guidance).
pub struct GnssProcessor {
    device_id: i64,
    cfg: GnssCalibrationConfig,
    state: State,
    history: VecDeque<HistPoint>,
    stats: GnssStats,
    store: Option<Arc<dyn GnssOriginStore>>,
    load: Arc<Mutex<LoadSlot>>,
    load_checked: bool,
}

impl GnssProcessor {
    /// Construction never blocks. If an origin was previously persisted for
    /// this device, call [`GnssProcessor::start`] to kick off the
    /// asynchronous, non-blocking load.
    pub fn new(device_id: i64, cfg: GnssCalibrationConfig) -> Self {
        Self {
            device_id,
            cfg,
            state: State::AwaitingCandidates {
                candidates: Vec::new(),
            },
            history: VecDeque::new(),
            stats: GnssStats::default(),
            store: None,
            load: Arc::new(Mutex::new(LoadSlot::Pending)),
            load_checked: false,
        }
    }

    /// Starts the asynchronous origin load and remembers `store` for future
    /// saves on lock. Safe to call once; the pipeline may proceed in
    /// AWAITING_CANDIDATES while the load is in flight.
    pub fn start(&mut self, store: Arc<dyn GnssOriginStore>) {
        let slot = self.load.clone();
        let device_id = self.device_id;
        let loader = store.clone();
        self.store = Some(store);
        tokio::spawn(async move {
            let row = loader.load_gnss_origin(device_id).await;
            let origin = row.as_ref().and_then(Origin::from_row);
            *slot.lock().await = LoadSlot::Done(origin);
        });
    }

    pub fn stats(&self) -> GnssStats {
        self.stats
    }

    /// Explicit reset path: drops calibration and any pending load result,
    /// returning the processor to AWAITING_CANDIDATES.
    pub fn reset_origin(&mut self) {
        self.state = State::AwaitingCandidates {
            candidates: Vec::new(),
        };
        self.history.clear();
    }

    async fn adopt_loaded_origin_if_ready(&mut self) {
        if self.load_checked || matches!(self.state, State::OriginLocked(_)) {
            return;
        }
        if let Ok(guard) = self.load.try_lock() {
            if let LoadSlot::Done(origin) = &*guard {
                self.load_checked = true;
                if let Some(origin) = origin.clone() {
                    info!(device_id = self.device_id, "GNSS origin loaded from persistence");
                    self.state = State::OriginLocked(origin);
                }
            }
        }
    }

    /// Processes one raw GNGGA-style frame. Never raises — parse errors are
    /// counted and dropped.
    pub async fn process(&mut self, payload: &str, now: DateTime<Utc>) -> GnssOutcome {
        self.adopt_loaded_origin_if_ready().await;

        let parsed = match parse_gngga(payload) {
            Some(p) => p,
            None => return GnssOutcome::Dropped,
        };

        let state = std::mem::replace(
            &mut self.state,
            State::AwaitingCandidates {
                candidates: Vec::new(),
            },
        );

        match state {
            State::AwaitingCandidates { mut candidates } => {
                let outcome = self.handle_collection(parsed, &mut candidates).await;
                if !matches!(self.state, State::OriginLocked(_)) {
                    self.state = State::AwaitingCandidates { candidates };
                }
                outcome
            }
            State::OriginLocked(origin) => {
                let outcome = self.handle_processing(parsed, &origin, now);
                self.state = State::OriginLocked(origin);
                outcome
            }
        }
    }

    async fn handle_collection(
        &mut self,
        parsed: ParsedFrame,
        candidates: &mut Vec<WgsPoint>,
    ) -> GnssOutcome {
        if parsed.fix_quality < self.cfg.min_fix_quality {
            self.stats.low_quality_rejected += 1;
            return GnssOutcome::WaitingForQuality {
                message: format!(
                    "low quality fix ({} < {})",
                    parsed.fix_quality, self.cfg.min_fix_quality
                ),
            };
        }

        candidates.push(parsed.wgs);

        if candidates.len() < self.cfg.required_points {
            return GnssOutcome::OriginCollecting {
                count: candidates.len(),
                target: self.cfg.required_points,
            };
        }

        let n = candidates.len() as f64;
        let center_lat = candidates.iter().map(|p| p.lat).sum::<f64>() / n;
        let center_lon = candidates.iter().map(|p| p.lon).sum::<f64>() / n;
        let center_h = candidates.iter().map(|p| p.h).sum::<f64>() / n;

        let max_dist = candidates
            .iter()
            .map(|p| geo::haversine_3d(center_lat, center_lon, center_h, p.lat, p.lon, p.h))
            .fold(0.0_f64, f64::max);

        if max_dist <= self.cfg.max_spread_m {
            let origin = Origin::from_centroid(center_lat, center_lon, center_h);
            info!(
                device_id = self.device_id,
                lat = center_lat,
                lon = center_lon,
                spread_m = max_dist,
                "GNSS origin locked"
            );

            if let Some(store) = &self.store {
                let rotation_flat = flatten_mat3(&origin.rotation);
                let ecef = origin.ecef;
                store
                    .save_gnss_origin(
                        self.device_id,
                        origin.lat,
                        origin.lon,
                        origin.h,
                        max_dist,
                        candidates.len() as i32,
                        rotation_flat,
                        ecef,
                    )
                    .await;
            } else {
                warn!(
                    device_id = self.device_id,
                    "no origin store wired, GNSS lock will not survive restart"
                );
            }

            let outcome = GnssOutcome::OriginLocked {
                lat: origin.lat,
                lon: origin.lon,
                h: origin.h,
                spread_meters: max_dist,
                num_points: candidates.len(),
            };
            self.state = State::OriginLocked(origin);
            outcome
        } else {
            self.stats.origin_resets += 1;
            candidates.clear();
            GnssOutcome::OriginReset {
                message: format!(
                    "spread too high ({max_dist:.2}m > {}m)",
                    self.cfg.max_spread_m
                ),
            }
        }
    }

    fn handle_processing(
        &mut self,
        parsed: ParsedFrame,
        origin: &Origin,
        now: DateTime<Utc>,
    ) -> GnssOutcome {
        if parsed.fix_quality < self.cfg.min_fix_quality {
            self.stats.low_quality_rejected += 1;
            return GnssOutcome::Dropped;
        }

        let ts = now.timestamp() as f64 + now.timestamp_subsec_nanos() as f64 * 1e-9;
        let ecef = geo::ecef(parsed.wgs.lat, parsed.wgs.lon, parsed.wgs.h);

        self.history.push_back(HistPoint { ts, ecef });
        while self.history.len() > self.cfg.filter_window_size + 1 {
            self.history.pop_front();
        }

        if self.history.len() < 2 {
            return GnssOutcome::Dropped;
        }

        let p_new = &self.history[self.history.len() - 1];
        let p_old = &self.history[self.history.len() - 2];
        let dt = p_new.ts - p_old.ts;
        if dt < 0.01 {
            return GnssOutcome::Dropped;
        }

        let v_ecef_raw = scale(&geo::vec3_sub(p_new.ecef, p_old.ecef), 1.0 / dt);
        let v_enu_raw = geo::mat3_mul_vec3(&origin.rotation, v_ecef_raw);

        let v_enu_filtered = if self.history.len() >= self.cfg.filter_window_size {
            let mut velocities: Vec<Vec3> = Vec::new();
            for i in 1..self.history.len() {
                let p1 = &self.history[i];
                let p0 = &self.history[i - 1];
                let idt = p1.ts - p0.ts;
                if idt >= 0.01 {
                    let iv_ecef = scale(&geo::vec3_sub(p1.ecef, p0.ecef), 1.0 / idt);
                    velocities.push(geo::mat3_mul_vec3(&origin.rotation, iv_ecef));
                }
            }
            if velocities.is_empty() {
                v_enu_raw
            } else {
                mean_vec3(&velocities)
            }
        } else {
            v_enu_raw
        };

        let pos_enu = geo::mat3_mul_vec3(&origin.rotation, geo::vec3_sub(ecef, origin.ecef));
        let total_displacement_mm = 1000.0 * geo::vec3_norm(pos_enu);
        let speed_2d = (v_enu_filtered[0].powi(2) + v_enu_filtered[1].powi(2)).sqrt();

        self.stats.total_processed += 1;

        GnssOutcome::Processed(GnssRecord {
            timestamp: now,
            lat: parsed.wgs.lat,
            lon: parsed.wgs.lon,
            h: parsed.wgs.h,
            pos_e: pos_enu[0],
            pos_n: pos_enu[1],
            pos_u: pos_enu[2],
            total_displacement_mm,
            vel_e: v_enu_filtered[0],
            vel_n: v_enu_filtered[1],
            vel_u: v_enu_filtered[2],
            speed_2d,
            speed_2d_mm_s: speed_2d * 1000.0,
            fix_quality: parsed.fix_quality,
            num_sats: parsed.num_sats,
            hdop: parsed.hdop,
        })
    }
}

fn scale(v: &Vec3, s: f64) -> Vec3 {
    [v[0] * s, v[1] * s, v[2] * s]
}

fn mean_vec3(vs: &[Vec3]) -> Vec3 {
    let n = vs.len() as f64;
    let mut acc = [0.0, 0.0, 0.0];
    for v in vs {
        acc[0] += v[0];
        acc[1] += v[1];
        acc[2] += v[2];
    }
    [acc[0] / n, acc[1] / n, acc[2] / n]
}

fn flatten_mat3(m: &Mat3) -> [f64; 9] {
    [
        m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
    ]
}

/// Parses positional fields out of a GNGGA-style comma-separated frame.
/// Frames with unparseable or missing lat/lon are dropped silently.
fn parse_gngga(payload: &str) -> Option<ParsedFrame> {
    let parts: Vec<&str> = payload.split(',').collect();
    if parts.len() < 10 {
        return None;
    }

    let lat_str = parts[2];
    let lon_str = parts[4];
    if lat_str.is_empty() || lon_str.is_empty() {
        return None;
    }

    let lat_dir = parts[3];
    let lon_dir = parts[5];

    if lat_str.len() < 3 || lon_str.len() < 4 {
        return None;
    }

    let lat_deg: f64 = lat_str[..2].parse().ok()?;
    let lat_min: f64 = lat_str[2..].parse().ok()?;
    let mut lat = lat_deg + lat_min / 60.0;
    if lat_dir == "S" {
        lat = -lat;
    }

    let lon_deg: f64 = lon_str[..3].parse().ok()?;
    let lon_min: f64 = lon_str[3..].parse().ok()?;
    let mut lon = lon_deg + lon_min / 60.0;
    if lon_dir == "W" {
        lon = -lon;
    }

    let h: f64 = parts[9].parse().unwrap_or(0.0);
    let fix_quality: u8 = parts[6].parse().unwrap_or(0);
    let num_sats: u32 = parts[7].parse().unwrap_or(0);
    let hdop: f64 = parts[8].parse().unwrap_or(99.9);

    Some(ParsedFrame {
        wgs: WgsPoint { lat, lon, h },
        fix_quality,
        num_sats,
        hdop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    fn gngga(lat: &str, lat_dir: &str, lon: &str, lon_dir: &str, fix: u8, h: &str) -> String {
        format!("$GNGGA,123456.00,{lat},{lat_dir},{lon},{lon_dir},{fix},08,0.9,{h},M,0,M,,")
    }

    struct NullStore;

    #[async_trait]
    impl GnssOriginStore for NullStore {
        async fn load_gnss_origin(&self, _device_id: i64) -> Option<crate::models::GnssOriginRow> {
            None
        }
        async fn save_gnss_origin(
            &self,
            _device_id: i64,
            _lat: f64,
            _lon: f64,
            _h: f64,
            _spread_meters: f64,
            _num_points: i32,
            _rotation_matrix: [f64; 9],
            _ecef_origin: [f64; 3],
        ) {
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        saved: StdMutex<Vec<(i64, f64, f64, f64)>>,
    }

    #[async_trait]
    impl GnssOriginStore for RecordingStore {
        async fn load_gnss_origin(&self, _device_id: i64) -> Option<crate::models::GnssOriginRow> {
            None
        }
        async fn save_gnss_origin(
            &self,
            device_id: i64,
            lat: f64,
            lon: f64,
            h: f64,
            _spread_meters: f64,
            _num_points: i32,
            _rotation_matrix: [f64; 9],
            _ecef_origin: [f64; 3],
        ) {
            self.saved.lock().unwrap().push((device_id, lat, lon, h));
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn origin_lock_success_emits_collecting_then_locked() {
        let mut p = GnssProcessor::new(1, GnssCalibrationConfig::default());
        let store = Arc::new(RecordingStore::default());
        p.start(store.clone());

        let frame = gngga("2101.6800", "N", "10551.2400", "E", 4, "12.3");
        for i in 0..4 {
            let outcome = p.process(&frame, now()).await;
            match outcome {
                GnssOutcome::OriginCollecting { count, .. } => assert_eq!(count, i + 1),
                other => panic!("expected collecting, got {other:?}"),
            }
        }

        let outcome = p.process(&frame, now()).await;
        match outcome {
            GnssOutcome::OriginLocked { lat, lon, .. } => {
                assert!((lat - 21.028).abs() < 1e-3);
                assert!((lon - 105.854).abs() < 1e-3);
            }
            other => panic!("expected locked, got {other:?}"),
        }
        assert_eq!(store.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn never_emits_processed_while_awaiting_candidates() {
        let mut p = GnssProcessor::new(2, GnssCalibrationConfig::default());
        p.start(Arc::new(NullStore));
        let frame = gngga("2101.6800", "N", "10551.2400", "E", 4, "12.3");
        for _ in 0..4 {
            let outcome = p.process(&frame, now()).await;
            assert!(!matches!(outcome, GnssOutcome::Processed(_)));
        }
    }

    #[tokio::test]
    async fn origin_reset_on_high_dispersion() {
        let mut p = GnssProcessor::new(3, GnssCalibrationConfig::default());
        p.start(Arc::new(NullStore));

        // ~50m of latitude scatter (1 arc-second of latitude is ~31m).
        let frames = [
            gngga("2101.6800", "N", "10551.2400", "E", 4, "12.3"),
            gngga("2101.6900", "N", "10551.2400", "E", 4, "12.3"),
            gngga("2101.7000", "N", "10551.2400", "E", 4, "12.3"),
            gngga("2101.6800", "N", "10551.2400", "E", 4, "12.3"),
            gngga("2101.6800", "N", "10551.2400", "E", 4, "12.3"),
        ];

        let mut saw_reset = false;
        for frame in &frames {
            if let GnssOutcome::OriginReset { .. } = p.process(frame, now()).await {
                saw_reset = true;
            }
        }
        assert!(saw_reset);
        assert_eq!(p.stats().origin_resets, 1);
    }

    #[tokio::test]
    async fn speed_2d_mm_s_matches_velocity_components() {
        let mut p = GnssProcessor::new(4, GnssCalibrationConfig::default());
        p.start(Arc::new(NullStore));
        let lock_frame = gngga("2101.6800", "N", "10551.2400", "E", 4, "12.3");
        for _ in 0..5 {
            p.process(&lock_frame, now()).await;
        }

        let t1 = now();
        let t2 = t1 + chrono::Duration::milliseconds(500);
        let moved = gngga("2101.6801", "N", "10551.2401", "E", 4, "12.3");
        p.process(&moved, t1).await;
        let outcome = p.process(&moved, t2).await;
        if let GnssOutcome::Processed(record) = outcome {
            let expected = (record.vel_e.powi(2) + record.vel_n.powi(2)).sqrt() * 1000.0;
            assert!((record.speed_2d_mm_s - expected).abs() < 1e-6);
            assert!(
                (record.total_displacement_mm
                    - 1000.0
                        * (record.pos_e.powi(2) + record.pos_n.powi(2) + record.pos_u.powi(2))
                            .sqrt())
                .abs()
                    < 1e-6
            );
        } else {
            panic!("expected processed record");
        }
    }

    #[test]
    fn parse_drops_unparseable_frame() {
        assert!(parse_gngga("$GNGGA,too,short").is_none());
        assert!(parse_gngga("$GNGGA,123456,,N,,,E,4,08,0.9,12.3,M").is_none());
    }
}
