//! Distance-based deviation detection.
//!
//! Compares the subject's current position with the position expected at
//! the same progress along the matched route. Persisting the resulting
//! [`DeviationEvent`](crate::DeviationEvent) is the engine's job; this module
//! is pure geometry.

use crate::geo_utils::haversine_distance;
use crate::progress::{estimate_progress, interpolate_position};
use crate::GeoPoint;

/// Geometry of a deviation check that crossed the threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviationCheck {
    pub actual: GeoPoint,
    pub expected: GeoPoint,
    /// Fraction of the route completed
    pub progress: f64,
    /// Meters between `actual` and `expected`
    pub distance: f64,
}

/// Check `current` against the route.
///
/// `trace` is the live journey trace; its most recent point drives the
/// progress estimate. Returns `Some` only when the distance to the expected
/// position is strictly greater than `threshold` meters.
pub fn detect_deviation(
    trace: &[GeoPoint],
    route_points: &[GeoPoint],
    current: GeoPoint,
    threshold: f64,
) -> Option<DeviationCheck> {
    let progress = estimate_progress(trace, route_points);
    let expected = interpolate_position(route_points, progress)?;
    let distance = haversine_distance(&current, &expected);

    if distance > threshold {
        Some(DeviationCheck {
            actual: current,
            expected,
            progress,
            distance,
        })
    } else {
        None
    }
}
