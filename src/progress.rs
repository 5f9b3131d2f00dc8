//! Progress along a matched route.
//!
//! Progress is the index of the route point nearest to the subject's most
//! recent position, normalised to [0, 1]. This is a nearest-vertex scan, not
//! a projection onto the path: it is O(route length) per sample and can step
//! backwards when an out-and-back route passes near an earlier vertex.

use crate::geo_utils::{haversine_distance, lerp};
use crate::GeoPoint;

/// Fraction of the route completed, judged from the last point of `trace`.
///
/// Returns 0.0 when the trace is empty or the route has fewer than two points.
pub fn estimate_progress(trace: &[GeoPoint], route_points: &[GeoPoint]) -> f64 {
    let Some(current) = trace.last() else {
        return 0.0;
    };
    if route_points.len() < 2 {
        return 0.0;
    }

    let mut nearest_index = 0;
    let mut nearest_distance = f64::INFINITY;
    for (i, p) in route_points.iter().enumerate() {
        let d = haversine_distance(current, p);
        if d < nearest_distance {
            nearest_distance = d;
            nearest_index = i;
        }
    }

    nearest_index as f64 / (route_points.len() - 1) as f64
}

/// Position on the route at `progress` (clamped to [0, 1]), interpolated
/// between the two route points around the fractional index.
pub fn interpolate_position(route_points: &[GeoPoint], progress: f64) -> Option<GeoPoint> {
    match route_points {
        [] => None,
        [only] => Some(*only),
        _ => {
            let progress = if progress.is_nan() {
                0.0
            } else {
                progress.clamp(0.0, 1.0)
            };
            let exact_index = progress * (route_points.len() - 1) as f64;
            let lower = exact_index.floor() as usize;
            let upper = (exact_index.ceil() as usize).min(route_points.len() - 1);
            let weight = exact_index - lower as f64;

            Some(lerp(&route_points[lower], &route_points[upper], weight))
        }
    }
}

/// Where the subject should be right now: progress from the live trace,
/// mapped back onto the route.
pub fn expected_position(trace: &[GeoPoint], route_points: &[GeoPoint]) -> Option<GeoPoint> {
    interpolate_position(route_points, estimate_progress(trace, route_points))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_route() -> Vec<GeoPoint> {
        (0..=10).map(|i| GeoPoint::new(0.0, i as f64 * 0.001)).collect()
    }

    #[test]
    fn test_progress_at_ends() {
        let route = straight_route();
        assert_eq!(estimate_progress(&[route[0]], &route), 0.0);
        assert_eq!(estimate_progress(&[route[10]], &route), 1.0);
    }

    #[test]
    fn test_progress_uses_latest_point() {
        let route = straight_route();
        let trace = vec![route[0], route[2], GeoPoint::new(0.0001, 0.0061)];
        assert!((estimate_progress(&trace, &route) - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_progress_degenerate() {
        let route = straight_route();
        assert_eq!(estimate_progress(&[], &route), 0.0);
        assert_eq!(estimate_progress(&[route[3]], &route[..1]), 0.0);
    }

    #[test]
    fn test_progress_can_jump_backwards_on_out_and_back() {
        // Out 5 points, back 5 points along the same line
        let mut route: Vec<GeoPoint> = (0..=5).map(|i| GeoPoint::new(0.0, i as f64 * 0.001)).collect();
        route.extend((0..5).rev().map(|i| GeoPoint::new(0.0, i as f64 * 0.001)));
        // On the way back near the 2nd vertex, the scan finds the outbound one first
        let p = estimate_progress(&[GeoPoint::new(0.0, 0.001)], &route);
        assert!((p - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_interpolate_position() {
        let route = straight_route();
        assert_eq!(interpolate_position(&route, 0.0), Some(route[0]));
        assert_eq!(interpolate_position(&route, 1.0), Some(route[10]));

        let mid = interpolate_position(&route, 0.25).unwrap();
        assert!((mid.longitude - 0.0025).abs() < 1e-12);
        assert_eq!(mid.latitude, 0.0);
    }

    #[test]
    fn test_interpolate_clamps() {
        let route = straight_route();
        assert_eq!(interpolate_position(&route, -3.0), Some(route[0]));
        assert_eq!(interpolate_position(&route, 7.5), Some(route[10]));
        assert_eq!(interpolate_position(&route, f64::NAN), Some(route[0]));
        assert_eq!(interpolate_position(&[], 0.5), None);
        assert_eq!(interpolate_position(&route[..1], 0.5), Some(route[0]));
    }

    #[test]
    fn test_expected_position_snaps_to_route() {
        let route = straight_route();
        // 50 m north of vertex 4
        let trace = vec![GeoPoint::new(0.00045, 0.004)];
        let expected = expected_position(&trace, &route).unwrap();
        assert_eq!(expected, route[4]);
    }
}
