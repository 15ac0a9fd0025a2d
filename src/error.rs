//! Error type shared by the index, the matcher and the build pipeline.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PopularityError>;

/// Everything that can go wrong while building, loading or querying a
/// popularity index.
///
/// Out-of-range edge ids are not represented here: passing one to the raw
/// accessors is a caller bug and panics.
#[derive(Debug, Error)]
pub enum PopularityError {
    /// The store was constructed against an unusable network view or with an
    /// invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The persisted header does not carry the expected magic constant. The
    /// index has to be rebuilt.
    #[error(
        "incorrect popularity index version in {}: expected magic 0x{expected:08x}, found 0x{found:08x}",
        path.display()
    )]
    FormatVersion {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    /// The persisted record count does not match the network edge count.
    #[error(
        "popularity index {} holds {found} records but the network has {expected} edges",
        path.display()
    )]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        found: u64,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A track file could not be parsed as a track document.
    #[error("malformed track file {}: {reason}", path.display())]
    MalformedTrack { path: PathBuf, reason: String },

    /// A per-way popularity file could not be parsed.
    #[error("malformed popularity file {}: {reason}", path.display())]
    MalformedPopularity { path: PathBuf, reason: String },

    /// A single track file failed and the build was configured to abort.
    #[error("track file {} aborted the build: {source}", path.display())]
    TrackFile {
        path: PathBuf,
        #[source]
        source: Box<PopularityError>,
    },
}

impl PopularityError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn malformed_track(path: &Path, reason: impl Into<String>) -> Self {
        Self::MalformedTrack {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_version_message() {
        let err = PopularityError::FormatVersion {
            path: PathBuf::from("/tmp/popularity_index"),
            expected: 0x4AD1,
            found: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("incorrect popularity index version"));
        assert!(msg.contains("0x00004ad1"));
    }

    #[test]
    fn test_track_file_keeps_source() {
        use std::error::Error;

        let inner = PopularityError::malformed_track(Path::new("a.json"), "missing track_points");
        let err = PopularityError::TrackFile {
            path: PathBuf::from("a.json"),
            source: Box::new(inner),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("a.json"));
    }
}
