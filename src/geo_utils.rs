//! # Geographic Utilities
//!
//! Distance and projection helpers used to snap GPS points onto network edges.
//!
//! | Item | Description |
//! |------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`compute_center`] | Centroid of a set of points |
//! | [`LocalProjection`] | Equirectangular projection to planar meters around a reference latitude |
//! | [`distance_to_segment`] | Meters from a point to the closest point of a segment |
//!
//! ## Coordinate System
//!
//! All functions expect WGS84 coordinates (latitude/longitude in degrees).
//! Planar coordinates produced by [`LocalProjection`] are `[x, y]` in meters,
//! which is the layout the R-tree in [`crate::network`] indexes.

use geo::{Closest, ClosestPoint, Distance, Haversine, Line, Point};

use crate::GpsPoint;

/// Meters per degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEGREE: f64 = 111_320.0;

// =============================================================================
// Distance Functions
// =============================================================================

/// Great-circle distance between two GPS points in meters.
///
/// ```rust
/// use popularity_index::{GpsPoint, geo_utils};
///
/// // Two fixes one thousandth of a degree apart along a meridian
/// let a = GpsPoint::new(45.500, -122.67);
/// let b = GpsPoint::new(45.501, -122.67);
///
/// let meters = geo_utils::haversine_distance(&a, &b);
/// assert!((meters - 111.2).abs() < 0.5);
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Arithmetic centroid of a set of points. Returns (0, 0) for empty input.
pub fn compute_center(points: &[GpsPoint]) -> GpsPoint {
    if points.is_empty() {
        return GpsPoint::new(0.0, 0.0);
    }

    let sum_lat: f64 = points.iter().map(|p| p.latitude).sum();
    let sum_lng: f64 = points.iter().map(|p| p.longitude).sum();
    let n = points.len() as f64;

    GpsPoint::new(sum_lat / n, sum_lng / n)
}

// =============================================================================
// Projection
// =============================================================================

/// Equirectangular projection around a fixed reference latitude.
///
/// Accurate to well under a meter over city-sized extents, which is plenty
/// for a snap threshold of a few meters. Final snap distances are refined
/// with [`haversine_distance`] anyway.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalProjection {
    lng_meters_per_deg: f64,
}

impl LocalProjection {
    pub fn new(reference_lat: f64) -> Self {
        // Clamp so longitudes near the poles don't collapse to zero width.
        let scale = reference_lat.to_radians().cos().max(0.1);
        Self {
            lng_meters_per_deg: METERS_PER_DEGREE * scale,
        }
    }

    /// Project to planar `[x, y]` meters.
    #[inline]
    pub fn project(&self, point: &GpsPoint) -> [f64; 2] {
        [
            point.longitude * self.lng_meters_per_deg,
            point.latitude * METERS_PER_DEGREE,
        ]
    }

    #[inline]
    pub fn unproject(&self, xy: [f64; 2]) -> GpsPoint {
        GpsPoint::new(xy[1] / METERS_PER_DEGREE, xy[0] / self.lng_meters_per_deg)
    }

    /// Ratio of true to projected east-west meters at `latitude`.
    ///
    /// Below 1 poleward of the reference latitude, where planar distances
    /// overstate real ones.
    pub fn longitude_stretch(&self, latitude: f64) -> f64 {
        METERS_PER_DEGREE * latitude.to_radians().cos() / self.lng_meters_per_deg
    }
}

/// Distance in meters from `point` to the closest point on segment `a`-`b`.
///
/// The closest point is located in the projected plane and the distance is
/// then measured on the sphere.
pub fn distance_to_segment(
    projection: &LocalProjection,
    point: &GpsPoint,
    a: &GpsPoint,
    b: &GpsPoint,
) -> f64 {
    let [px, py] = projection.project(point);
    let [ax, ay] = projection.project(a);
    let [bx, by] = projection.project(b);

    let line = Line::new((ax, ay), (bx, by));
    let closest = match line.closest_point(&Point::new(px, py)) {
        Closest::Intersection(p) | Closest::SinglePoint(p) => p,
        // Only happens for degenerate input; fall back to the segment start.
        Closest::Indeterminate => Point::new(ax, ay),
    };

    haversine_distance(point, &projection.unproject([closest.x(), closest.y()]))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_haversine_distance_same_point() {
        let p = GpsPoint::new(45.5231, -122.6765);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_compute_center() {
        let points = vec![GpsPoint::new(45.50, -122.60), GpsPoint::new(45.52, -122.62)];
        let center = compute_center(&points);
        assert!(approx_eq(center.latitude, 45.51, 0.001));
        assert!(approx_eq(center.longitude, -122.61, 0.001));
    }

    #[test]
    fn test_compute_center_empty() {
        let center = compute_center(&[]);
        assert_eq!(center.latitude, 0.0);
        assert_eq!(center.longitude, 0.0);
    }

    #[test]
    fn test_projection_round_trip() {
        let projection = LocalProjection::new(45.5);
        let p = GpsPoint::new(45.5231, -122.6765);
        let back = projection.unproject(projection.project(&p));
        assert!(approx_eq(back.latitude, p.latitude, 1e-9));
        assert!(approx_eq(back.longitude, p.longitude, 1e-9));
    }

    #[test]
    fn test_longitude_stretch() {
        let projection = LocalProjection::new(45.0);
        assert!(approx_eq(projection.longitude_stretch(45.0), 1.0, 1e-12));
        assert!(projection.longitude_stretch(60.0) < 1.0);
        assert!(projection.longitude_stretch(25.0) > 1.0);
    }

    #[test]
    fn test_distance_to_segment_perpendicular() {
        let projection = LocalProjection::new(45.5);
        let a = GpsPoint::new(45.5, -122.6800);
        let b = GpsPoint::new(45.5, -122.6700);
        // ~11 m north of the middle of an east-west segment
        let p = GpsPoint::new(45.5001, -122.6750);

        let d = distance_to_segment(&projection, &p, &a, &b);
        assert!(approx_eq(d, 11.1, 0.5), "got {d}");
    }

    #[test]
    fn test_distance_to_segment_beyond_endpoint() {
        let projection = LocalProjection::new(45.5);
        let a = GpsPoint::new(45.5, -122.6800);
        let b = GpsPoint::new(45.5, -122.6700);
        let p = GpsPoint::new(45.5, -122.6600);

        let d = distance_to_segment(&projection, &p, &a, &b);
        assert!(approx_eq(d, haversine_distance(&p, &b), 0.01));
    }
}
