//! Turning one track into per-edge traversal evidence.
//!
//! ## Algorithm
//! 1. Snap every usable track point to its nearest edge
//! 2. Drop snaps at or beyond the maximum snap distance
//! 3. Run the confirmed-segment filter over the remaining touches
//!
//! The filter only counts an edge when two consecutive touches land on it,
//! and counts each run of touches on the same edge at most once. A single
//! stray point never counts, and dwelling on one edge for a long time does
//! not inflate it.

use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::network::EdgeLocator;
use crate::track::load_track;
use crate::{EdgeId, GpsPoint};

/// Default maximum snap distance in meters (exclusive).
pub const MAX_SNAP_DISTANCE: f64 = 5.0;

/// Per-edge increment counts for one track.
pub type Tally = HashMap<EdgeId, u32>;

/// A track point snapped to an edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeTouch {
    pub edge_id: EdgeId,
    pub snap_distance: f64,
}

/// Snaps tracks onto a network through an [`EdgeLocator`].
///
/// Holds no state between tracks, so one matcher can be shared by all
/// workers of a build.
#[derive(Debug, Clone, Copy)]
pub struct EdgeMatcher<L> {
    locator: L,
    max_snap_distance: f64,
}

impl<L: EdgeLocator> EdgeMatcher<L> {
    pub fn new(locator: L, max_snap_distance: f64) -> Self {
        Self {
            locator,
            max_snap_distance,
        }
    }

    pub fn locator(&self) -> &L {
        &self.locator
    }

    /// Snap a single point. `None` when no edge lies strictly within the
    /// maximum snap distance.
    pub fn snap(&self, point: &GpsPoint) -> Option<EdgeTouch> {
        let found = self
            .locator
            .find_nearest_edge(point.latitude, point.longitude)?;

        (found.distance < self.max_snap_distance).then_some(EdgeTouch {
            edge_id: found.edge_id,
            snap_distance: found.distance,
        })
    }

    /// Snap a track, preserving point order and skipping unmatched points.
    pub fn edge_touches(&self, points: &[GpsPoint]) -> Vec<EdgeTouch> {
        points.iter().filter_map(|p| self.snap(p)).collect()
    }

    /// Tally of confirmed traversals for an in-memory track.
    pub fn match_points(&self, points: &[GpsPoint]) -> Tally {
        confirmed_tally(&self.edge_touches(points))
    }

    /// Load, snap and tally one track file.
    pub fn match_file(&self, path: &Path) -> Result<Tally> {
        let points = load_track(path)?;
        Ok(self.match_points(&points))
    }
}

/// Confirmed-segment filter.
///
/// Touch `i > 0` is counted when it is on the same edge as touch `i - 1` and
/// that edge is not the one most recently counted.
pub fn confirmed_tally(touches: &[EdgeTouch]) -> Tally {
    let mut tally = Tally::new();
    let Some(first) = touches.first() else {
        return tally;
    };

    let mut prev = first.edge_id;
    let mut last: Option<EdgeId> = None;

    for touch in &touches[1..] {
        let edge = touch.edge_id;
        if edge == prev && last != Some(edge) {
            *tally.entry(edge).or_insert(0) += 1;
            last = Some(edge);
        }
        prev = edge;
    }

    tally
}
