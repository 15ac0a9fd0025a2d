//! `popularity_index` file format and the in-process store.
//!
//! Format (little-endian):
//!
//! Header (4 bytes):
//!   magic:   u32 = 19153   // i32::MAX / 112121
//!
//! Body (edge_count * u32):
//!   u32 raw_popularity[edge_count]   // indexed by edge id
//!
//! Record `e` lives at byte offset `HEADER_SIZE + e * RECORD_WIDTH`, so the
//! file is directly addressable by edge id. The record count is implied by the
//! file length and has to match the edge count of the network the index is
//! loaded against.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{PopularityError, Result};
use crate::network::RoadNetwork;
use crate::EdgeId;

/// Version guard written at offset 0. Bump when the layout changes.
pub const MAGIC: u32 = (i32::MAX / 112_121) as u32;
pub const HEADER_SIZE: usize = 4;
pub const RECORD_WIDTH: usize = 4;

/// What a routing cost function needs from the index.
pub trait PopularityLookup {
    /// Strictly positive popularity score of an edge.
    fn popularity(&self, edge_id: EdgeId) -> u32;
}

/// Header summary of an index file, readable without a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub magic: u32,
    pub record_count: u64,
}

impl IndexHeader {
    pub fn is_current(&self) -> bool {
        self.magic == MAGIC
    }
}

/// Per-edge popularity counters backed by one file.
///
/// Lifecycle: [`create`](Self::create) → populate → [`flush`](Self::flush) →
/// [`close`](Self::close), or [`load_existing`](Self::load_existing) →
/// query → close. Stores returned by `load_existing` are read-only.
#[derive(Debug)]
pub struct PopularityStore {
    path: PathBuf,
    file: File,
    records: Vec<u32>,
    read_only: bool,
}

impl PopularityStore {
    /// Allocate a zeroed index for every edge of `network`, backed by a fresh
    /// file at `path` (truncating any previous index).
    ///
    /// Nothing is durable until [`flush`](Self::flush); until then the file
    /// carries a zero header and will not load.
    pub fn create<P, N>(path: P, network: &N) -> Result<Self>
    where
        P: AsRef<Path>,
        N: RoadNetwork + ?Sized,
    {
        let path = path.as_ref();
        let edge_count = checked_edge_count(network)?;
        let capacity = byte_size(edge_count);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| PopularityError::io(path, e))?;
        file.set_len(capacity)
            .map_err(|e| PopularityError::io(path, e))?;

        info!(
            "Created popularity index {} for {} edges ({} bytes)",
            path.display(),
            edge_count,
            capacity
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            records: vec![0; edge_count],
            read_only: false,
        })
    }

    /// Open a previously flushed index.
    ///
    /// Returns `Ok(None)` when no index exists at `path`. A wrong magic is a
    /// [`PopularityError::FormatVersion`]; a record count that differs from the
    /// network's edge count is a [`PopularityError::SizeMismatch`].
    pub fn load_existing<P, N>(path: P, network: &N) -> Result<Option<Self>>
    where
        P: AsRef<Path>,
        N: RoadNetwork + ?Sized,
    {
        let path = path.as_ref();
        let edge_count = checked_edge_count(network)?;

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PopularityError::io(path, e)),
        };

        let mut bytes = Vec::with_capacity(byte_size(edge_count) as usize);
        file.read_to_end(&mut bytes)
            .map_err(|e| PopularityError::io(path, e))?;

        let header = parse_header(path, &bytes, bytes.len() as u64)?;
        if !header.is_current() {
            return Err(PopularityError::FormatVersion {
                path: path.to_path_buf(),
                expected: MAGIC,
                found: header.magic,
            });
        }
        if header.record_count != edge_count as u64 {
            return Err(PopularityError::SizeMismatch {
                path: path.to_path_buf(),
                expected: edge_count as u64,
                found: header.record_count,
            });
        }

        let records: Vec<u32> = bytes[HEADER_SIZE..]
            .chunks_exact(RECORD_WIDTH)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        info!(
            "Loaded popularity index {} ({} edges)",
            path.display(),
            records.len()
        );

        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
            records,
            read_only: true,
        }))
    }

    /// Read only the header of an index file.
    pub fn read_header<P: AsRef<Path>>(path: P) -> Result<IndexHeader> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PopularityError::io(path, e))?;
        let len = file
            .metadata()
            .map_err(|e| PopularityError::io(path, e))?
            .len();

        let mut prefix = Vec::with_capacity(HEADER_SIZE);
        file.take(HEADER_SIZE as u64)
            .read_to_end(&mut prefix)
            .map_err(|e| PopularityError::io(path, e))?;

        parse_header(path, &prefix, len)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn edge_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Allocated size in bytes, header included.
    pub fn capacity(&self) -> u64 {
        byte_size(self.records.len())
    }

    pub fn raw_records(&self) -> &[u32] {
        &self.records
    }

    /// Raw counter of an edge. Panics if `edge_id` is out of range.
    #[inline]
    pub fn get_raw(&self, edge_id: EdgeId) -> u32 {
        self.records[edge_id as usize]
    }

    /// Overwrite the raw counter of an edge. Panics if `edge_id` is out of
    /// range or the store is read-only.
    pub fn set_raw(&mut self, edge_id: EdgeId, value: u32) {
        self.assert_writable();
        self.records[edge_id as usize] = value;
    }

    /// Add to the raw counter of an edge, saturating at `u32::MAX`. Returns
    /// the new value.
    pub fn add_raw(&mut self, edge_id: EdgeId, increment: u32) -> u32 {
        self.assert_writable();
        let slot = &mut self.records[edge_id as usize];
        *slot = slot.saturating_add(increment);
        *slot
    }

    /// `raw + 1`, so an edge nobody rode still has a usable weight.
    #[inline]
    pub fn popularity(&self, edge_id: EdgeId) -> u32 {
        self.get_raw(edge_id).saturating_add(1)
    }

    /// Write the header and every record, then sync the file.
    pub fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Err(PopularityError::Configuration(format!(
                "popularity index {} was opened read-only",
                self.path.display()
            )));
        }

        self.write_all()
            .map_err(|e| PopularityError::io(&self.path, e))?;
        debug!("Flushed popularity index {}", self.path.display());
        Ok(())
    }

    /// Release the file handle. Does not flush.
    pub fn close(self) {
        debug!("Closed popularity index {}", self.path.display());
    }

    fn write_all(&mut self) -> io::Result<()> {
        write_index(&mut self.file, &self.records, File::sync_data)?;
        self.file.sync_all()
    }

    fn assert_writable(&self) {
        assert!(
            !self.read_only,
            "popularity index {} is read-only",
            self.path.display()
        );
    }
}

impl PopularityLookup for PopularityStore {
    #[inline]
    fn popularity(&self, edge_id: EdgeId) -> u32 {
        PopularityStore::popularity(self, edge_id)
    }
}

/// Write a complete index image to `out`.
///
/// The header is zeroed first and the magic goes in last, after `barrier`
/// has made the records durable. An interrupted write leaves either the old
/// image or a file that does not load, never a mix of both.
fn write_index<W: Write + Seek>(
    out: &mut W,
    records: &[u32],
    barrier: fn(&W) -> io::Result<()>,
) -> io::Result<()> {
    out.seek(SeekFrom::Start(0))?;
    {
        let mut writer = BufWriter::new(&mut *out);
        writer.write_all(&[0u8; HEADER_SIZE])?;
        for record in records {
            writer.write_all(&record.to_le_bytes())?;
        }
        writer.flush()?;
    }
    barrier(out)?;

    out.seek(SeekFrom::Start(0))?;
    out.write_all(&MAGIC.to_le_bytes())?;
    out.flush()
}

fn checked_edge_count<N: RoadNetwork + ?Sized>(network: &N) -> Result<usize> {
    if network.is_contracted() {
        return Err(PopularityError::Configuration(
            "build the popularity index against the base network, not a contracted view".into(),
        ));
    }

    let edge_count = network.edge_count();
    if edge_count as u64 > EdgeId::MAX as u64 + 1 {
        return Err(PopularityError::Configuration(format!(
            "{edge_count} edges exceed the addressable edge id range"
        )));
    }
    Ok(edge_count)
}

fn byte_size(edge_count: usize) -> u64 {
    HEADER_SIZE as u64 + edge_count as u64 * RECORD_WIDTH as u64
}

/// Header of a file of `file_len` bytes whose first bytes are `prefix`.
fn parse_header(path: &Path, prefix: &[u8], file_len: u64) -> Result<IndexHeader> {
    if file_len < HEADER_SIZE as u64 || prefix.len() < HEADER_SIZE {
        return Err(PopularityError::SizeMismatch {
            path: path.to_path_buf(),
            expected: HEADER_SIZE as u64,
            found: file_len,
        });
    }

    let magic = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    let body = file_len - HEADER_SIZE as u64;
    if body % RECORD_WIDTH as u64 != 0 {
        return Err(PopularityError::SizeMismatch {
            path: path.to_path_buf(),
            expected: body / RECORD_WIDTH as u64 + 1,
            found: body / RECORD_WIDTH as u64,
        });
    }

    Ok(IndexHeader {
        magic,
        record_count: body / RECORD_WIDTH as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Edges(usize);

    impl RoadNetwork for Edges {
        fn edge_count(&self) -> usize {
            self.0
        }
    }

    /// Accepts `budget` bytes, then fails every write like a full disk.
    struct FullDisk {
        inner: io::Cursor<Vec<u8>>,
        budget: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = self.inner.write(&buf[..buf.len().min(self.budget)])?;
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FullDisk {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    fn image(records: &[u32]) -> Vec<u8> {
        let mut bytes = MAGIC.to_le_bytes().to_vec();
        for record in records {
            bytes.extend_from_slice(&record.to_le_bytes());
        }
        bytes
    }

    struct Contracted;

    impl RoadNetwork for Contracted {
        fn edge_count(&self) -> usize {
            4
        }

        fn is_contracted(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_magic_constant() {
        assert_eq!(MAGIC, 19153);
    }

    #[test]
    fn test_fresh_store_popularity_is_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = PopularityStore::create(dir.path().join("idx"), &Edges(5)).unwrap();

        assert_eq!(store.capacity(), 4 + 5 * 4);
        for e in 0..5 {
            assert_eq!(store.get_raw(e), 0);
            assert_eq!(store.popularity(e), 1);
        }
    }

    #[test]
    fn test_create_allocates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        let _store = PopularityStore::create(&path, &Edges(10)).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 44);
    }

    #[test]
    fn test_flush_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");

        let mut store = PopularityStore::create(&path, &Edges(4)).unwrap();
        store.set_raw(1, 7);
        store.add_raw(3, 2);
        store.add_raw(3, 1);
        store.flush().unwrap();
        store.close();

        let loaded = PopularityStore::load_existing(&path, &Edges(4)).unwrap().unwrap();
        assert!(loaded.is_read_only());
        assert_eq!(loaded.raw_records(), &[0, 7, 0, 3]);
        assert_eq!(loaded.popularity(0), 1);
        assert_eq!(loaded.popularity(1), 8);
        assert_eq!(loaded.popularity(3), 4);

        let header = PopularityStore::read_header(&path).unwrap();
        assert_eq!(header, IndexHeader { magic: MAGIC, record_count: 4 });
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = PopularityStore::load_existing(dir.path().join("nope"), &Edges(4)).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_unflushed_index_does_not_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");

        let mut store = PopularityStore::create(&path, &Edges(3)).unwrap();
        store.set_raw(0, 9);
        store.close();

        let err = PopularityStore::load_existing(&path, &Edges(3)).unwrap_err();
        assert!(matches!(err, PopularityError::FormatVersion { found: 0, .. }));
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");

        let mut bytes = 0xDEAD_BEEFu32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[1, 0, 0, 0, 2, 0, 0, 0]);
        std::fs::write(&path, bytes).unwrap();

        match PopularityStore::load_existing(&path, &Edges(2)) {
            Err(PopularityError::FormatVersion { expected, found, .. }) => {
                assert_eq!(expected, MAGIC);
                assert_eq!(found, 0xDEAD_BEEF);
            }
            other => panic!("expected FormatVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_edge_count_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");

        let mut store = PopularityStore::create(&path, &Edges(3)).unwrap();
        store.flush().unwrap();
        store.close();

        let err = PopularityStore::load_existing(&path, &Edges(4)).unwrap_err();
        assert!(matches!(err, PopularityError::SizeMismatch { expected: 4, found: 3, .. }));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        let mut bytes = MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[1, 0]);
        std::fs::write(&path, bytes).unwrap();

        let err = PopularityStore::load_existing(&path, &Edges(1)).unwrap_err();
        assert!(matches!(err, PopularityError::SizeMismatch { .. }));
    }

    #[test]
    fn test_contracted_network_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = PopularityStore::create(dir.path().join("idx"), &Contracted).unwrap_err();
        assert!(matches!(err, PopularityError::Configuration(_)));
    }

    #[test]
    fn test_read_only_store_cannot_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        let mut store = PopularityStore::create(&path, &Edges(1)).unwrap();
        store.flush().unwrap();
        store.close();

        let mut loaded = PopularityStore::load_existing(&path, &Edges(1)).unwrap().unwrap();
        assert!(matches!(loaded.flush(), Err(PopularityError::Configuration(_))));
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_edge_panics() {
        let dir = tempfile::tempdir().unwrap();
        let store = PopularityStore::create(dir.path().join("idx"), &Edges(2)).unwrap();
        store.get_raw(2);
    }

    #[test]
    fn test_add_saturates() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PopularityStore::create(dir.path().join("idx"), &Edges(1)).unwrap();
        store.set_raw(0, u32::MAX - 1);
        assert_eq!(store.add_raw(0, 5), u32::MAX);
        assert_eq!(store.popularity(0), u32::MAX);
    }

    #[test]
    fn test_interrupted_write_never_loads_mixed_records() {
        let old = image(&[1, 1, 1]);
        let new = image(&[5, 6, 7]);
        // Zeroed header, records, then the magic.
        let total_written = new.len() + HEADER_SIZE;

        for budget in 0..=total_written {
            let mut out = FullDisk {
                inner: io::Cursor::new(old.clone()),
                budget,
            };
            let result = write_index(&mut out, &[5, 6, 7], |_| Ok(()));
            let bytes = out.inner.into_inner();

            if budget == total_written {
                assert!(result.is_ok());
                assert_eq!(bytes, new);
                continue;
            }

            assert!(result.is_err(), "budget {budget}");
            let header = parse_header(Path::new("idx"), &bytes, bytes.len() as u64).unwrap();
            assert!(
                !header.is_current() || bytes == old || bytes == new,
                "budget {budget} left a loadable mix: {bytes:?}"
            );
        }
    }

    #[test]
    fn test_short_file_is_size_mismatch_on_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        std::fs::write(&path, [0xd1, 0x4a]).unwrap();

        let err = PopularityStore::read_header(&path).unwrap_err();
        assert!(matches!(err, PopularityError::SizeMismatch { found: 2, .. }));
        let err = PopularityStore::load_existing(&path, &Edges(0)).unwrap_err();
        assert!(matches!(err, PopularityError::SizeMismatch { found: 2, .. }));
    }

    #[test]
    fn test_read_header_rejects_partial_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        let mut bytes = image(&[3]);
        bytes.extend_from_slice(&[1, 0]);
        std::fs::write(&path, bytes).unwrap();

        let err = PopularityStore::read_header(&path).unwrap_err();
        assert!(matches!(err, PopularityError::SizeMismatch { .. }));
    }
}
