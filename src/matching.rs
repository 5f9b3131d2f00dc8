//! Route similarity scoring.
//!
//! Two traces are compared in three steps:
//! - both are simplified so point density does not bias the result
//! - start and end points must be close, otherwise the score is zero
//! - both are resampled to the same number of evenly spaced points and the
//!   per-index point similarity is averaged
//!
//! The final score is `0.2 * start + 0.2 * end + 0.6 * path`, in [0, 1].

use crate::geo_utils::{haversine_distance, lerp, polyline_length};
use crate::simplify::simplify_trace;
use crate::{GeoPoint, GuardConfig};

const START_WEIGHT: f64 = 0.2;
const END_WEIGHT: f64 = 0.2;
const PATH_WEIGHT: f64 = 0.6;

/// Similarity of two points: 1 when identical, falling linearly to 0 at
/// `radius` meters apart.
#[inline]
pub fn point_similarity(a: &GeoPoint, b: &GeoPoint, radius: f64) -> f64 {
    (1.0 - haversine_distance(a, b) / radius).max(0.0)
}

/// Score how alike two traces are, in [0, 1].
///
/// Returns 0 when either trace has fewer than `min_similarity_points`
/// points, or when the start or end points are too far apart.
///
/// # Example
/// ```
/// use route_guard::{GeoPoint, GuardConfig, route_similarity};
///
/// let config = GuardConfig::default();
/// let a: Vec<GeoPoint> = (0..10).map(|i| GeoPoint::new(0.0, i as f64 * 0.001)).collect();
/// let b: Vec<GeoPoint> = (0..10).map(|i| GeoPoint::new(0.01, i as f64 * 0.001)).collect();
///
/// assert!(route_similarity(&a, &a, &config) > 0.99);
/// assert_eq!(route_similarity(&a, &b, &config), 0.0); // ~1.1 km apart
/// ```
pub fn route_similarity(trace_a: &[GeoPoint], trace_b: &[GeoPoint], config: &GuardConfig) -> f64 {
    if trace_a.len() < config.min_similarity_points || trace_b.len() < config.min_similarity_points
    {
        return 0.0;
    }

    let simplified_a = simplify_trace(trace_a, config.simplification_epsilon);
    let simplified_b = simplify_trace(trace_b, config.simplification_epsilon);

    // Simplification keeps endpoints, so these are the raw first/last points
    let (Some(start_a), Some(start_b), Some(end_a), Some(end_b)) = (
        simplified_a.first(),
        simplified_b.first(),
        simplified_a.last(),
        simplified_b.last(),
    ) else {
        return 0.0;
    };

    let radius = config.endpoint_similarity_radius;
    let start_sim = point_similarity(start_a, start_b, radius);
    let end_sim = point_similarity(end_a, end_b, radius);

    if start_sim < config.endpoint_similarity_min || end_sim < config.endpoint_similarity_min {
        return 0.0;
    }

    let path_sim = path_similarity(&simplified_a, &simplified_b, config);

    (START_WEIGHT * start_sim + END_WEIGHT * end_sim + PATH_WEIGHT * path_sim).clamp(0.0, 1.0)
}

/// Mean point similarity of the two traces after resampling both to
/// `resample_count` points.
pub fn path_similarity(trace_a: &[GeoPoint], trace_b: &[GeoPoint], config: &GuardConfig) -> f64 {
    let resampled_a = resample_route(trace_a, config.resample_count);
    let resampled_b = resample_route(trace_b, config.resample_count);

    let pairs = resampled_a.len().min(resampled_b.len());
    if pairs == 0 {
        return 0.0;
    }

    let total: f64 = resampled_a
        .iter()
        .zip(resampled_b.iter())
        .map(|(a, b)| point_similarity(a, b, config.endpoint_similarity_radius))
        .sum();

    total / pairs as f64
}

/// Resample a route to exactly `target_count` points, evenly spaced by
/// distance along the path.
///
/// The first and last input points are always emitted unchanged;
/// intermediate points are linearly interpolated between the vertices that
/// straddle each target distance.
pub fn resample_route(points: &[GeoPoint], target_count: usize) -> Vec<GeoPoint> {
    if points.is_empty() || target_count == 0 {
        return Vec::new();
    }
    if target_count == 1 {
        return vec![points[0]];
    }
    if points.len() == 1 {
        return vec![points[0]; target_count];
    }

    let first = points[0];
    let last = points[points.len() - 1];

    let total_dist = polyline_length(points);
    if total_dist == 0.0 {
        let mut resampled = vec![first; target_count - 1];
        resampled.push(last);
        return resampled;
    }

    // cumulative[i] = distance along the path up to points[i]
    let mut cumulative = Vec::with_capacity(points.len());
    cumulative.push(0.0);
    for w in points.windows(2) {
        let prev = cumulative[cumulative.len() - 1];
        cumulative.push(prev + haversine_distance(&w[0], &w[1]));
    }

    let step_dist = total_dist / (target_count - 1) as f64;
    let mut resampled = Vec::with_capacity(target_count);
    resampled.push(first);

    let mut segment = 0;
    for k in 1..target_count - 1 {
        let target = step_dist * k as f64;
        while segment < points.len() - 2 && cumulative[segment + 1] < target {
            segment += 1;
        }

        let seg_len = cumulative[segment + 1] - cumulative[segment];
        let ratio = if seg_len > 0.0 {
            ((target - cumulative[segment]) / seg_len).clamp(0.0, 1.0)
        } else {
            0.0
        };
        resampled.push(lerp(&points[segment], &points[segment + 1], ratio));
    }

    resampled.push(last);
    resampled
}
