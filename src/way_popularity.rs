//! Per-way popularity strategy.
//!
//! The older popularity source: one (usually gzip-compressed) JSON object
//! mapping OSM way ids to a popularity value,
//!
//! ```json
//! { "4021351": 12, "4021400": 3 }
//! ```
//!
//! joined to network edges through an [`EdgeWayIndex`]. Every edge of a way
//! with positive popularity gets that value as its raw counter.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PopularityError, Result};
use crate::pipeline::{BuildSummary, PopularityBuildStrategy, ProgressReporter};
use crate::store::PopularityStore;
use crate::track::read_maybe_gzip;
use crate::EdgeId;

/// Edge id → OSM way id, filled while the network is imported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeWayIndex {
    ways: HashMap<EdgeId, u64>,
}

impl EdgeWayIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `{ "<edge id>": <way id>, ... }`.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PopularityError::io(path, e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            PopularityError::Configuration(format!(
                "cannot read edge/way mapping {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Returns the way previously mapped to `edge_id`, if any.
    pub fn put(&mut self, edge_id: EdgeId, way_id: u64) -> Option<u64> {
        self.ways.insert(edge_id, way_id)
    }

    pub fn get(&self, edge_id: EdgeId) -> Option<u64> {
        self.ways.get(&edge_id).copied()
    }

    pub fn len(&self) -> usize {
        self.ways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ways.is_empty()
    }
}

impl FromIterator<(EdgeId, u64)> for EdgeWayIndex {
    fn from_iter<I: IntoIterator<Item = (EdgeId, u64)>>(iter: I) -> Self {
        Self {
            ways: iter.into_iter().collect(),
        }
    }
}

/// Parse a per-way popularity document.
///
/// Keys must be way ids. Values are read as integers; fractional values are
/// truncated, anything non-numeric counts as zero and is later ignored.
pub fn parse_way_popularity(path: &Path, content: &[u8]) -> Result<HashMap<u64, u32>> {
    let malformed = |reason: String| PopularityError::MalformedPopularity {
        path: path.to_path_buf(),
        reason,
    };

    let root: HashMap<String, Value> =
        serde_json::from_slice(content).map_err(|e| malformed(e.to_string()))?;

    root.into_iter()
        .map(|(key, value)| {
            let way_id = key
                .parse::<u64>()
                .map_err(|_| malformed(format!("way id {key:?} is not an integer")))?;
            let popularity = value
                .as_f64()
                .filter(|v| *v > 0.0)
                .map_or(0, |v| v.min(u32::MAX as f64) as u32);
            Ok((way_id, popularity))
        })
        .collect()
}

/// Fills the store from a per-way popularity file.
pub struct WayPopularityStrategy {
    popularity_file: PathBuf,
    edge_ways: EdgeWayIndex,
}

impl WayPopularityStrategy {
    pub fn new<P: Into<PathBuf>>(popularity_file: P, edge_ways: EdgeWayIndex) -> Self {
        Self {
            popularity_file: popularity_file.into(),
            edge_ways,
        }
    }
}

impl PopularityBuildStrategy for WayPopularityStrategy {
    fn name(&self) -> &str {
        "way-popularity"
    }

    fn load_data(
        &self,
        store: &mut PopularityStore,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<BuildSummary> {
        let path = self.popularity_file.as_path();
        let content = read_maybe_gzip(path).map_err(|e| PopularityError::io(path, e))?;
        let popularities = parse_way_popularity(path, &content)?;
        info!(
            "Loaded popularity for {} ways from {}",
            popularities.len(),
            path.display()
        );

        let mut summary = BuildSummary {
            files_total: 1,
            files_merged: 1,
            ..BuildSummary::default()
        };

        for edge_id in 0..store.edge_count() as EdgeId {
            let Some(way_id) = self.edge_ways.get(edge_id) else {
                continue;
            };
            match popularities.get(&way_id) {
                Some(&popularity) if popularity > 0 => {
                    store.set_raw(edge_id, popularity);
                    summary.increments_applied += u64::from(popularity);
                    summary.edges_with_evidence += 1;
                }
                _ => {}
            }
        }

        debug!(
            "{} of {} edges have way popularity",
            summary.edges_with_evidence,
            store.edge_count()
        );
        reporter.finished(&summary);
        Ok(summary)
    }
}
