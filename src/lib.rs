//! # Popularity Index
//!
//! Per-edge popularity for a road/path network, computed from GPS track logs
//! and persisted as a compact array keyed by edge id.
//!
//! This library provides:
//! - Snapping GPS points onto network edges (R-tree backed [`EdgeSnapIndex`])
//! - A confirmed-segment filter that turns snapped points into per-edge tallies
//! - A parallel build pipeline merging tallies from many track files
//! - The on-disk [`PopularityStore`] with a magic-header version guard
//! - Routing cost helpers ([`popularity_weight`], [`classify`])
//!
//! ## Features
//!
//! - **`cli`** (default) - the `popularity-index` command line tool
//!
//! ## Quick Start
//!
//! ```rust
//! use popularity_index::{EdgeGeometry, EdgeMatcher, EdgeSnapIndex, GpsPoint, MAX_SNAP_DISTANCE};
//!
//! // One east-west edge
//! let edges = vec![EdgeGeometry::new(
//!     0,
//!     &[GpsPoint::new(45.5, -122.680), GpsPoint::new(45.5, -122.670)],
//! )];
//! let matcher = EdgeMatcher::new(EdgeSnapIndex::build(&edges), MAX_SNAP_DISTANCE);
//!
//! let track = vec![
//!     GpsPoint::new(45.50001, -122.678),
//!     GpsPoint::new(45.50001, -122.676),
//!     GpsPoint::new(45.50001, -122.674),
//! ];
//!
//! let tally = matcher.match_points(&track);
//! assert_eq!(tally.get(&0), Some(&1));
//! ```

pub mod error;
pub mod geo_utils;
pub mod matcher;
pub mod network;
pub mod pipeline;
pub mod store;
pub mod track;
pub mod way_popularity;
pub mod weighting;

pub use error::{PopularityError, Result};
pub use matcher::{confirmed_tally, EdgeMatcher, EdgeTouch, Tally, MAX_SNAP_DISTANCE};
pub use network::{
    EdgeGeometry, EdgeLocator, EdgeMatch, EdgeSnapIndex, NetworkGeometry, RoadNetwork,
};
pub use pipeline::{
    merge_tally, prepare_index, tally_files, BuildConfig, BuildProgress, BuildSummary,
    EdgeTallyStrategy, FailurePolicy, FileFailure, LogReporter, PopularityBuildStrategy,
    ProgressReporter, SilentReporter,
};
pub use store::{IndexHeader, PopularityLookup, PopularityStore, MAGIC};
pub use track::TrackFileSource;
pub use way_popularity::{EdgeWayIndex, WayPopularityStrategy};
pub use weighting::{classify, popularity_weight, PopularityWeighting, WayAttributes};

// ============================================================================
// Core Types
// ============================================================================

/// Network edge identifier, dense in `0..edge_count`.
pub type EdgeId = u32;

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use popularity_index::GpsPoint;
/// let point = GpsPoint::new(45.5231, -122.6765); // Portland
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(45.5231, -122.6765).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_snap_index_and_matcher_together() {
        let edges = vec![
            EdgeGeometry::new(0, &[GpsPoint::new(45.5, -122.680), GpsPoint::new(45.5, -122.670)]),
            EdgeGeometry::new(1, &[GpsPoint::new(45.5, -122.670), GpsPoint::new(45.51, -122.670)]),
        ];
        let matcher = EdgeMatcher::new(EdgeSnapIndex::build(&edges), MAX_SNAP_DISTANCE);

        // Ride east along edge 0, then turn north onto edge 1, with one GPS
        // spike far off the road in between.
        let track = vec![
            GpsPoint::new(45.50001, -122.678),
            GpsPoint::new(45.50002, -122.676),
            GpsPoint::new(45.5100, -122.675),
            GpsPoint::new(45.50001, -122.674),
            GpsPoint::new(45.502, -122.67001),
            GpsPoint::new(45.504, -122.67002),
        ];

        let tally = matcher.match_points(&track);
        assert_eq!(tally, Tally::from([(0, 1), (1, 1)]));
    }
}
