//! WGS-84 geodetic math: ECEF conversion, ECEF→ENU rotation, and the
//! haversine-plus-vertical distance used to size GNSS origin-candidate
//! dispersion. Grounded on `original_source/backend/processors/gnss_processor.py`.

const A_WGS84: f64 = 6_378_137.0;
const F_WGS84: f64 = 1.0 / 298.257223563;
const E2_WGS84: f64 = 2.0 * F_WGS84 - F_WGS84 * F_WGS84;
const MEAN_EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A point in Cartesian space (ECEF, or ENU once rotated).
pub type Vec3 = [f64; 3];

/// Row-major 3x3 rotation matrix.
pub type Mat3 = [[f64; 3]; 3];

pub fn mat3_mul_vec3(m: &Mat3, v: Vec3) -> Vec3 {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

pub fn vec3_sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn vec3_norm(v: Vec3) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// Converts a WGS-84 geodetic position (degrees, degrees, meters) into ECEF
/// Cartesian coordinates using the WGS-84 ellipsoid constants.
pub fn ecef(lat_deg: f64, lon_deg: f64, h: f64) -> Vec3 {
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();
    let sin_lat = lat.sin();
    let cos_lat = lat.cos();

    let n = A_WGS84 / (1.0 - E2_WGS84 * sin_lat * sin_lat).sqrt();
    let x = (n + h) * cos_lat * lon.cos();
    let y = (n + h) * cos_lat * lon.sin();
    let z = (n * (1.0 - E2_WGS84) + h) * sin_lat;
    [x, y, z]
}

/// The standard ECEF→ENU rotation matrix at a chosen origin (lat0, lon0).
pub fn rotation(lat0_deg: f64, lon0_deg: f64) -> Mat3 {
    let lat0 = lat0_deg.to_radians();
    let lon0 = lon0_deg.to_radians();
    let (sl0, cl0) = (lon0.sin(), lon0.cos());
    let (sf0, cf0) = (lat0.sin(), lat0.cos());

    [
        [-sl0, cl0, 0.0],
        [-sf0 * cl0, -sf0 * sl0, cf0],
        [cf0 * cl0, cf0 * sl0, sf0],
    ]
}

/// 3-D distance between two WGS-84 points: haversine great-circle in the
/// horizontal plane, combined in quadrature with the height difference.
pub fn haversine_3d(lat1: f64, lon1: f64, h1: f64, lat2: f64, lon2: f64, h2: f64) -> f64 {
    let (lat1_r, lon1_r, lat2_r, lon2_r) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlon = lon2_r - lon1_r;
    let dlat = lat2_r - lat1_r;
    let a = (dlat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    let distance_2d = MEAN_EARTH_RADIUS_M * c;
    (distance_2d * distance_2d + (h2 - h1) * (h2 - h1)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecef_round_trips_plausible_magnitude() {
        let p = ecef(21.0280, 105.8540, 12.3);
        let r = vec3_norm(p);
        // Roughly Earth's radius — sanity bound, not a geodesy round-trip.
        assert!((6_300_000.0..6_400_000.0).contains(&r));
    }

    #[test]
    fn rotation_is_orthonormal() {
        let r = rotation(21.0, 105.0);
        for row in r {
            let n = (row[0] * row[0] + row[1] * row[1] + row[2] * row[2]).sqrt();
            assert!((n - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn haversine_same_point_is_zero() {
        let d = haversine_3d(21.0, 105.0, 10.0, 21.0, 105.0, 10.0);
        assert!(d < 1e-9);
    }

    #[test]
    fn haversine_includes_vertical_component() {
        let d = haversine_3d(21.0, 105.0, 0.0, 21.0, 105.0, 100.0);
        assert!((d - 100.0).abs() < 1e-6);
    }
}
