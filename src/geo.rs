// 🌍 Geo Utilities - Great-circle distance and felt-radius estimates
// Pure functions, no I/O. Everything downstream (shakemap, scoring) measures
// earthquake/airport separation through `distance_km`.

use serde::{Deserialize, Serialize};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Mean Earth radius used by the haversine formula (km)
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// MMI V: strong shaking, the level where infrastructure becomes a concern
const FELT_MMI_THRESHOLD: f64 = 5.0;

/// Floor so that small or deep quakes still have a visible footprint
pub const MIN_FELT_RADIUS_KM: f64 = 5.0;

// ============================================================================
// COORDINATE
// ============================================================================

/// A point on the Earth's surface in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Coordinate { lat, lon }
    }
}

// ============================================================================
// DISTANCE
// ============================================================================

/// Great-circle distance in kilometers (haversine).
///
/// Longitudes are compared modulo 360, so `(0, 10)` and `(0, 370)` are the
/// same point and yield exactly zero. The computation only uses operations
/// that are exact under argument swap, so `distance_km(a, b) == distance_km(b, a)`
/// holds bit-for-bit.
pub fn distance_km(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = wrap_longitude_delta(b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.clamp(0.0, 1.0).sqrt().asin()
}

/// Fold a longitude difference into [-180, 180]
fn wrap_longitude_delta(delta: f64) -> f64 {
    let r = delta % 360.0;
    if r > 180.0 {
        r - 360.0
    } else if r < -180.0 {
        r + 360.0
    } else {
        r
    }
}

// ============================================================================
// FELT RADIUS
// ============================================================================

/// Radius (km) within which a surface-focus quake reaches MMI V.
///
/// Monotonically non-decreasing in magnitude. Used to skip grid lookups for
/// airport/earthquake pairs that are too far apart to feel strong shaking.
pub fn felt_radius_km(magnitude: f64) -> f64 {
    felt_radius_at_depth_km(magnitude, 0.0)
}

/// Surface radius (km) where shaking reaches MMI V for a quake at `depth_km`.
///
/// Solves the Atkinson & Wald (2007) intensity prediction equation
///
/// ```text
/// MMI = 3.70 + 1.17·M − 1.26·ln(R) − 0.0012·R
/// ```
///
/// for `MMI = 5` with Newton's method, then converts the hypocentral distance
/// to a surface distance. Never returns less than [`MIN_FELT_RADIUS_KM`].
pub fn felt_radius_at_depth_km(magnitude: f64, depth_km: f64) -> f64 {
    // f(R) = c - 1.26 ln R - 0.0012 R, root is the hypocentral radius
    let c = 3.70 + 1.17 * magnitude - FELT_MMI_THRESHOLD;
    if c <= 0.0 {
        return MIN_FELT_RADIUS_KM;
    }

    let mut r: f64 = 50.0;
    for _ in 0..50 {
        let f = c - 1.26 * r.ln() - 0.0012 * r;
        let f_prime = -1.26 / r - 0.0012;
        let mut next = r - f / f_prime;
        if next <= 0.0 {
            next = r / 2.0;
        }
        if (next - r).abs() < 0.01 {
            r = next;
            break;
        }
        r = next;
    }

    let depth = depth_km.max(0.0);
    if r <= depth {
        return MIN_FELT_RADIUS_KM;
    }

    let surface = (r * r - depth * depth).sqrt();
    ((surface * 10.0).round() / 10.0).max(MIN_FELT_RADIUS_KM)
}

// ============================================================================
// TESTS
// ============================================================================
