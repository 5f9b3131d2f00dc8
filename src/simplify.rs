//! Ramer-Douglas-Peucker trace simplification with a tolerance in meters.
//!
//! The chord projection happens in a local equirectangular frame and the
//! resulting offset is measured with [`haversine_distance`], so the tolerance
//! means the same thing everywhere on the globe. Sub-ranges are processed
//! from an explicit work stack, which keeps memory bounded by the number of
//! retained points rather than by recursion depth.

use crate::geo_utils::haversine_distance;
use crate::GeoPoint;

/// Distance in meters from `point` to the segment `start`..`end`.
///
/// The projection parameter is clamped to [0, 1], so points beyond either end
/// of the chord are measured to the nearer endpoint. A degenerate chord
/// (identical endpoints, e.g. a closed loop) measures to `start`.
pub fn perpendicular_distance(point: &GeoPoint, start: &GeoPoint, end: &GeoPoint) -> f64 {
    // Scale longitude so both axes are roughly meters-proportional
    let lng_scale = ((start.latitude + end.latitude) / 2.0).to_radians().cos();

    let chord_lat = end.latitude - start.latitude;
    let chord_lng = (end.longitude - start.longitude) * lng_scale;
    let to_point_lat = point.latitude - start.latitude;
    let to_point_lng = (point.longitude - start.longitude) * lng_scale;

    let chord_len_sq = chord_lat * chord_lat + chord_lng * chord_lng;
    let t = if chord_len_sq > 0.0 {
        ((to_point_lat * chord_lat + to_point_lng * chord_lng) / chord_len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let projected = GeoPoint::new(
        start.latitude + t * (end.latitude - start.latitude),
        start.longitude + t * (end.longitude - start.longitude),
    );
    haversine_distance(point, &projected)
}

/// Indices of the points kept by simplification, in ascending order.
pub fn simplify_indices(points: &[GeoPoint], epsilon: f64) -> Vec<usize> {
    if points.len() <= 2 {
        return (0..points.len()).collect();
    }

    let last = points.len() - 1;
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[last] = true;

    let mut stack = vec![(0usize, last)];
    while let Some((start, end)) = stack.pop() {
        if end <= start + 1 {
            continue;
        }

        let mut max_distance = 0.0;
        let mut max_index = start;
        for i in (start + 1)..end {
            let distance = perpendicular_distance(&points[i], &points[start], &points[end]);
            if distance > max_distance {
                max_distance = distance;
                max_index = i;
            }
        }

        if max_distance > epsilon {
            keep[max_index] = true;
            stack.push((max_index, end));
            stack.push((start, max_index));
        }
    }

    keep.iter()
        .enumerate()
        .filter_map(|(i, &k)| if k { Some(i) } else { None })
        .collect()
}

/// Reduce a dense trace to the points needed to keep its shape within
/// `epsilon` meters. Inputs of two points or fewer are returned unchanged.
///
/// # Example
/// ```rust
/// use route_guard::{GeoPoint, simplify_trace};
///
/// // A straight line collapses to its endpoints
/// let line: Vec<GeoPoint> = (0..50).map(|i| GeoPoint::new(0.0, i as f64 * 0.0001)).collect();
/// let simplified = simplify_trace(&line, 20.0);
/// assert_eq!(simplified, vec![line[0], line[49]]);
/// ```
pub fn simplify_trace(points: &[GeoPoint], epsilon: f64) -> Vec<GeoPoint> {
    simplify_indices(points, epsilon)
        .into_iter()
        .map(|i| points[i])
        .collect()
}
