//! Track file discovery and parsing.
//!
//! A track file is a JSON document with a `track_points` array; every point
//! carries `y` (latitude) and `x` (longitude). Files may be gzip-compressed,
//! which is detected from the content rather than the file name.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::debug;
use serde_json::Value;

use crate::error::{PopularityError, Result};
use crate::GpsPoint;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Enumerates the track files of a directory.
#[derive(Debug, Clone)]
pub struct TrackFileSource {
    root: PathBuf,
}

impl TrackFileSource {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All regular files directly under the root, sorted by path.
    ///
    /// Hidden files (leading `.`) are ignored. Sorting only makes logs
    /// reproducible; results never depend on file order.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.root).map_err(|e| PopularityError::io(&self.root, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PopularityError::io(&self.root, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| PopularityError::io(&path, e))?;

            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if file_type.is_file() && !hidden {
                files.push(path);
            }
        }

        files.sort();
        debug!("Found {} track files under {}", files.len(), self.root.display());
        Ok(files)
    }
}

/// Read a whole file, inflating it when it starts with the gzip magic bytes.
pub fn read_maybe_gzip(path: &Path) -> io::Result<Vec<u8>> {
    let mut raw = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut raw)?;

    if !raw.starts_with(&GZIP_MAGIC) {
        return Ok(raw);
    }

    let mut inflated = Vec::with_capacity(raw.len() * 4);
    GzDecoder::new(raw.as_slice()).read_to_end(&mut inflated)?;
    Ok(inflated)
}

/// Read a whole track file. A corrupt gzip stream counts as a malformed
/// track rather than an I/O failure.
pub fn read_track_file(path: &Path) -> Result<Vec<u8>> {
    read_maybe_gzip(path).map_err(|e| match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            PopularityError::malformed_track(path, format!("bad gzip stream: {e}"))
        }
        _ => PopularityError::io(path, e),
    })
}

/// Parse the `track_points` of a track document.
///
/// Points with a missing or non-numeric coordinate, or coordinates outside
/// the WGS84 range, are skipped. A document that is not JSON or has no
/// `track_points` array is an error.
pub fn parse_track_points(path: &Path, content: &[u8]) -> Result<Vec<GpsPoint>> {
    let root: Value = serde_json::from_slice(content)
        .map_err(|e| PopularityError::malformed_track(path, e.to_string()))?;

    let track_points = root
        .get("track_points")
        .and_then(Value::as_array)
        .ok_or_else(|| PopularityError::malformed_track(path, "missing track_points array"))?;

    let points: Vec<GpsPoint> = track_points
        .iter()
        .filter_map(|point| {
            let lat = point.get("y")?.as_f64()?;
            let lng = point.get("x")?.as_f64()?;
            Some(GpsPoint::new(lat, lng))
        })
        .filter(GpsPoint::is_valid)
        .collect();

    debug!(
        "{}: {} of {} track points usable",
        path.display(),
        points.len(),
        track_points.len()
    );
    Ok(points)
}

/// [`read_track_file`] followed by [`parse_track_points`].
pub fn load_track(path: &Path) -> Result<Vec<GpsPoint>> {
    let content = read_track_file(path)?;
    parse_track_points(path, &content)
}
