//! # Geographic Utilities
//!
//! The single distance primitive used by every other module, plus a few
//! helpers built on top of it.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two points |
//! | [`polyline_length`] | Total length of a trace in meters |
//! | [`lerp`] | Linear interpolation between two points in degree space |
//! | [`meters_to_degrees`] | Convert meters to approximate degrees at a latitude |
//!
//! ## Haversine Formula
//!
//! Distances are computed on a sphere of radius 6,371,000 m. Altitude is
//! ignored. The result is symmetric, zero for identical points and never
//! negative.

use crate::GeoPoint;

/// Earth radius used by all distance calculations, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points in meters.
///
/// # Example
///
/// ```rust
/// use route_guard::{GeoPoint, geo_utils};
///
/// let sf = GeoPoint::new(37.7749, -122.4194);
/// let la = GeoPoint::new(34.0522, -118.2437);
///
/// let distance = geo_utils::haversine_distance(&sf, &la);
/// assert!(distance > 530_000.0 && distance < 590_000.0);
/// ```
#[inline]
pub fn haversine_distance(p1: &GeoPoint, p2: &GeoPoint) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let d_lat = (p2.latitude - p1.latitude).to_radians();
    let d_lng = (p2.longitude - p1.longitude).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    // Rounding can push `a` a hair outside [0, 1] for antipodal or identical points
    let c = 2.0 * a.clamp(0.0, 1.0).sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Total length of a trace in meters. Empty or single-point traces return 0.0.
pub fn polyline_length(points: &[GeoPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Interpolate between `a` and `b` by `ratio` (0 = a, 1 = b) in degree space.
#[inline]
pub fn lerp(a: &GeoPoint, b: &GeoPoint, ratio: f64) -> GeoPoint {
    GeoPoint::new(
        a.latitude + ratio * (b.latitude - a.latitude),
        a.longitude + ratio * (b.longitude - a.longitude),
    )
}

/// Convert meters to approximate degrees at a given latitude.
///
/// Uses the longitude scale at that latitude, which is the larger of the two
/// degree spans, so a square search box built from it never under-covers.
#[inline]
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let lat_rad = latitude.to_radians();
    let meters_per_degree = 111_320.0 * lat_rad.cos().max(0.1);
    meters / meters_per_degree
}
