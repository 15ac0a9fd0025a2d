//! Seams to the host road network.
//!
//! The index never owns the network. It needs two things from it: how many
//! edges there are ([`RoadNetwork`]) and which edge a coordinate falls on
//! ([`EdgeLocator`]). [`EdgeSnapIndex`] is an R-tree backed locator over edge
//! polylines, and [`NetworkGeometry`] is a minimal JSON network description
//! that implements both seams for the CLI and for tests.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::info;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::error::{PopularityError, Result};
use crate::geo_utils::{compute_center, distance_to_segment, LocalProjection};
use crate::{EdgeId, GpsPoint};

/// Size information about the network the index is built for.
pub trait RoadNetwork {
    /// Number of edges; edge ids are dense in `0..edge_count()`.
    fn edge_count(&self) -> usize;

    /// True for shortcut/contracted views whose edge ids are not the base
    /// network's. The index must be built against the base network.
    fn is_contracted(&self) -> bool {
        false
    }
}

/// Nearest edge for a coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeMatch {
    pub edge_id: EdgeId,
    /// Distance from the query point to the edge in meters
    pub distance: f64,
}

/// Maps a coordinate to the nearest network edge.
///
/// Workers of the build pipeline query the same locator concurrently, hence
/// the `Send + Sync` bound.
pub trait EdgeLocator: Send + Sync {
    fn find_nearest_edge(&self, latitude: f64, longitude: f64) -> Option<EdgeMatch>;
}

impl<L: EdgeLocator + ?Sized> EdgeLocator for &L {
    fn find_nearest_edge(&self, latitude: f64, longitude: f64) -> Option<EdgeMatch> {
        (**self).find_nearest_edge(latitude, longitude)
    }
}

impl<L: EdgeLocator + ?Sized> EdgeLocator for std::sync::Arc<L> {
    fn find_nearest_edge(&self, latitude: f64, longitude: f64) -> Option<EdgeMatch> {
        (**self).find_nearest_edge(latitude, longitude)
    }
}

// =============================================================================
// Network geometry
// =============================================================================

/// Polyline of one edge, points as `[lat, lon]` pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeGeometry {
    pub edge_id: EdgeId,
    pub points: Vec<[f64; 2]>,
}

impl EdgeGeometry {
    pub fn new(edge_id: EdgeId, points: &[GpsPoint]) -> Self {
        Self {
            edge_id,
            points: points.iter().map(|p| [p.latitude, p.longitude]).collect(),
        }
    }

    fn gps_points(&self) -> impl Iterator<Item = GpsPoint> + '_ {
        self.points.iter().map(|[lat, lon]| GpsPoint::new(*lat, *lon))
    }
}

/// Minimal network description: an edge count plus edge polylines.
///
/// ```json
/// { "edge_count": 3, "edges": [ { "edge_id": 0, "points": [[45.5, -122.6], [45.5, -122.7]] } ] }
/// ```
///
/// When `edge_count` is omitted it is derived as the highest edge id + 1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkGeometry {
    #[serde(default)]
    pub edge_count: Option<usize>,
    pub edges: Vec<EdgeGeometry>,
}

impl NetworkGeometry {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PopularityError::io(path, e))?;
        let network: Self = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            PopularityError::Configuration(format!(
                "cannot read network geometry {}: {}",
                path.display(),
                e
            ))
        })?;

        let max_id = network.edges.iter().map(|e| e.edge_id as usize + 1).max().unwrap_or(0);
        if let Some(count) = network.edge_count {
            if count < max_id {
                return Err(PopularityError::Configuration(format!(
                    "network {} declares {} edges but references edge id {}",
                    path.display(),
                    count,
                    max_id - 1
                )));
            }
        }

        Ok(network)
    }

    /// Build the spatial index used to snap track points.
    pub fn snap_index(&self) -> EdgeSnapIndex {
        EdgeSnapIndex::build(&self.edges)
    }
}

impl RoadNetwork for NetworkGeometry {
    fn edge_count(&self) -> usize {
        self.edge_count.unwrap_or_else(|| {
            self.edges.iter().map(|e| e.edge_id as usize + 1).max().unwrap_or(0)
        })
    }
}

// =============================================================================
// R-tree locator
// =============================================================================

/// One straight piece of an edge polyline, stored in projected meters.
#[derive(Debug, Clone, Copy)]
struct EdgeSegment {
    edge_id: EdgeId,
    from: GpsPoint,
    to: GpsPoint,
    from_xy: [f64; 2],
    to_xy: [f64; 2],
}

impl RTreeObject for EdgeSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.from_xy, self.to_xy)
    }
}

impl PointDistance for EdgeSegment {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let [ax, ay] = self.from_xy;
        let dx = self.to_xy[0] - ax;
        let dy = self.to_xy[1] - ay;
        let len_2 = dx * dx + dy * dy;

        let t = if len_2 == 0.0 {
            0.0
        } else {
            (((point[0] - ax) * dx + (point[1] - ay) * dy) / len_2).clamp(0.0, 1.0)
        };

        let cx = ax + t * dx - point[0];
        let cy = ay + t * dy - point[1];
        cx * cx + cy * cy
    }
}

/// Slack for the gap between the projected and the spherical metric.
const SPHERE_SLACK: f64 = 0.99;

/// Spatial index over edge segments.
///
/// Candidates come out of the R-tree by planar distance in a projection
/// centred on the network and are ranked by the spherical distance to their
/// closest point. The walk stops once no remaining candidate can be closer.
pub struct EdgeSnapIndex {
    tree: RTree<EdgeSegment>,
    projection: LocalProjection,
    /// Lower bound of true over planar distance across the network's latitudes
    min_stretch: f64,
}

impl EdgeSnapIndex {
    pub fn build(edges: &[EdgeGeometry]) -> Self {
        let all_points: Vec<GpsPoint> = edges
            .iter()
            .flat_map(|e| e.gps_points())
            .filter(GpsPoint::is_valid)
            .collect();
        let projection = LocalProjection::new(compute_center(&all_points).latitude);
        let min_stretch = all_points
            .iter()
            .map(|p| projection.longitude_stretch(p.latitude))
            .fold(1.0, f64::min);

        let mut segments = Vec::with_capacity(all_points.len());
        for edge in edges {
            let points: Vec<GpsPoint> = edge.gps_points().filter(GpsPoint::is_valid).collect();
            let pairs: Vec<(GpsPoint, GpsPoint)> = match points.len() {
                0 => continue,
                1 => vec![(points[0], points[0])],
                _ => points.windows(2).map(|w| (w[0], w[1])).collect(),
            };

            for (from, to) in pairs {
                segments.push(EdgeSegment {
                    edge_id: edge.edge_id,
                    from,
                    to,
                    from_xy: projection.project(&from),
                    to_xy: projection.project(&to),
                });
            }
        }

        info!(
            "Built edge snap index: {} edges, {} segments",
            edges.len(),
            segments.len()
        );

        Self {
            tree: RTree::bulk_load(segments),
            projection,
            min_stretch,
        }
    }

    pub fn segment_count(&self) -> usize {
        self.tree.size()
    }
}

impl EdgeLocator for EdgeSnapIndex {
    fn find_nearest_edge(&self, latitude: f64, longitude: f64) -> Option<EdgeMatch> {
        let query = GpsPoint::new(latitude, longitude);
        let stretch = self
            .min_stretch
            .min(self.projection.longitude_stretch(latitude))
            * SPHERE_SLACK;

        let mut best: Option<EdgeMatch> = None;
        for (segment, planar_2) in self
            .tree
            .nearest_neighbor_iter_with_distance_2(&self.projection.project(&query))
        {
            if let Some(found) = best {
                if planar_2.sqrt() * stretch > found.distance {
                    break;
                }
            }

            let distance = distance_to_segment(&self.projection, &query, &segment.from, &segment.to);
            let closer = match best {
                Some(found) => distance < found.distance,
                None => true,
            };
            if closer {
                best = Some(EdgeMatch {
                    edge_id: segment.edge_id,
                    distance,
                });
            }
        }

        best
    }
}
