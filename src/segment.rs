//! Bounded chunks of the record log and their per-segment manifests.
//!
//! A segment is a [`LineIndexedFile`] of JSON records. Next to it lives a
//! one-line manifest holding the segment's start index and line-length list,
//! so the segment can be reopened without rescanning:
//!
//! ```text
//! segment_2.segment            {"angle": 0.1, ...}\n{"angle": 0.2, ...}\n
//! segment_2.segment_manifest   {"created_at": 1697040000.5, "line_lengths": [19, 19], "path": "segment_2.segment_manifest", "start_index": 2000}
//! ```

use crate::error::{Error, Result};
use crate::line_file::{LineIndexedFile, OpenMode, ReadStrategy};
use crate::record::{Record, decode_record, encode_record, to_line};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SEGMENT_EXTENSION: &str = "segment";
const MANIFEST_SUFFIX: &str = "_manifest";

/// File name of the `seq`-th segment (zero-based creation order).
pub fn segment_file_name(seq: usize) -> String {
    format!("segment_{seq}.{SEGMENT_EXTENSION}")
}

/// Manifest path for a segment: same stem, the segment's extension with a
/// `_manifest` suffix (`segment_0.segment_manifest`, and
/// `catalog_0.catalog_manifest` for datastores written by older tooling).
pub fn segment_manifest_path(segment_path: &Path) -> PathBuf {
    let extension = segment_path
        .extension()
        .map_or_else(|| SEGMENT_EXTENSION.into(), |ext| ext.to_string_lossy());
    segment_path.with_extension(format!("{extension}{MANIFEST_SUFFIX}"))
}

/// Line 1 of a segment manifest. Fields are declared in sorted order so the
/// written line has sorted keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentManifest {
    /// Seconds since the Unix epoch.
    pub created_at: f64,
    pub line_lengths: Vec<u64>,
    /// File name of the manifest itself.
    pub path: String,
    pub start_index: u64,
}

impl SegmentManifest {
    fn new(manifest_path: &Path, start_index: u64) -> Self {
        Self {
            created_at: unix_seconds_now(),
            line_lengths: Vec::new(),
            path: manifest_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            start_index,
        }
    }
}

#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    manifest: SegmentManifest,
    manifest_file: LineIndexedFile,
    data: LineIndexedFile,
}

impl Segment {
    /// Open the segment at `path`, creating it and its manifest in append
    /// mode. `start_index` is only used when a new manifest is written.
    pub fn open(
        path: impl AsRef<Path>,
        start_index: u64,
        mode: OpenMode,
        strategy: ReadStrategy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let manifest_path = segment_manifest_path(&path);
        let mut manifest_file = LineIndexedFile::open(&manifest_path, mode, None, strategy)?;

        let stored = if manifest_file.has_content() {
            let line = manifest_file.read_line_at(1)?;
            let manifest: SegmentManifest = serde_json::from_str(&line).map_err(|err| {
                Error::segment(format!(
                    "malformed segment manifest {}: {err}",
                    manifest_path.display()
                ))
            })?;
            Some(manifest)
        } else {
            None
        };

        let fresh = stored.is_none();
        let mut manifest =
            stored.unwrap_or_else(|| SegmentManifest::new(&manifest_path, start_index));
        if fresh && mode == OpenMode::ReadOnly {
            tracing::warn!(
                path = %manifest_path.display(),
                "segment manifest is empty; scanning segment"
            );
        }

        let data = LineIndexedFile::open(&path, mode, Some(&manifest.line_lengths), strategy)?;
        let in_sync = data.line_lengths() == manifest.line_lengths.as_slice();
        manifest.line_lengths = data.line_lengths().to_vec();

        let mut segment = Self {
            path,
            manifest,
            manifest_file,
            data,
        };
        if mode == OpenMode::Append && (fresh || !in_sync) {
            segment.write_manifest()?;
        }
        Ok(segment)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest_path(&self) -> &Path {
        self.manifest_file.path()
    }

    pub const fn manifest(&self) -> &SegmentManifest {
        &self.manifest
    }

    pub const fn start_index(&self) -> u64 {
        self.manifest.start_index
    }

    pub const fn created_at(&self) -> f64 {
        self.manifest.created_at
    }

    /// Number of records in the segment.
    pub fn len(&self) -> usize {
        self.data.lines()
    }

    pub fn is_empty(&self) -> bool {
        !self.data.has_content()
    }

    /// Encode and append one record.
    pub fn write_record<T: serde::Serialize + ?Sized>(&mut self, record: &T) -> Result<()> {
        let line = encode_record(record)?;
        self.write_encoded(&line)
    }

    /// Append a line produced by [`encode_record`].
    pub fn write_encoded(&mut self, line: &str) -> Result<()> {
        self.data.append(line)?;
        self.manifest.line_lengths = self.data.line_lengths().to_vec();
        self.write_manifest()
    }

    /// Record at `offset` (zero-based within this segment).
    pub fn read_record(&mut self, offset: usize) -> Result<Option<Record>> {
        let line = self.data.read_line_at(offset + 1)?;
        if line.is_empty() {
            return Ok(None);
        }
        decode_record(&line).map(Some)
    }

    /// Raw content of the next line under the read cursor.
    pub fn next_line(&mut self) -> Result<Option<String>> {
        self.data.next_line()
    }

    /// Next line as raw bytes. The cursor moves past it even when the bytes
    /// turn out not to be text.
    pub fn next_raw_line(&mut self) -> Result<Option<Vec<u8>>> {
        self.data.next_raw_line()
    }

    pub fn rewind(&mut self) {
        self.data.seek_line_start(1);
    }

    /// Keep the first `keep` records and drop the rest.
    pub fn truncate_records(&mut self, keep: usize) -> Result<()> {
        self.data.truncate_from(keep)?;
        self.manifest.line_lengths = self.data.line_lengths().to_vec();
        self.write_manifest()
    }

    pub fn close(&mut self) {
        self.manifest_file.close();
        self.data.close();
    }

    fn write_manifest(&mut self) -> Result<()> {
        let line = to_line(&self.manifest)?;
        self.manifest_file.truncate_from(0)?;
        self.manifest_file.append(&line)
    }
}

pub(crate) fn unix_seconds_now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::fs;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn open_append(path: &Path, start_index: u64) -> Segment {
        Segment::open(path, start_index, OpenMode::Append, ReadStrategy::Auto)
            .expect("open segment")
    }

    #[test]
    fn naming_follows_creation_order() {
        assert_eq!(segment_file_name(0), "segment_0.segment");
        assert_eq!(segment_file_name(12), "segment_12.segment");
        assert_eq!(
            segment_manifest_path(Path::new("/data/tub/segment_3.segment")),
            PathBuf::from("/data/tub/segment_3.segment_manifest")
        );
        assert_eq!(
            segment_manifest_path(Path::new("tub/catalog_0.catalog")),
            PathBuf::from("tub/catalog_0.catalog_manifest")
        );
    }

    #[test]
    fn new_segment_writes_its_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(1));
        let mut segment = open_append(&path, 1000);
        segment.close();

        let manifest_line = fs::read_to_string(dir.path().join("segment_1.segment_manifest")).unwrap();
        assert!(manifest_line.ends_with('\n'));
        assert_eq!(manifest_line.lines().count(), 1);
        let manifest: SegmentManifest = serde_json::from_str(manifest_line.trim_end()).unwrap();
        assert_eq!(manifest.start_index, 1000);
        assert_eq!(manifest.path, "segment_1.segment_manifest");
        assert!(manifest.line_lengths.is_empty());
        assert!(manifest.created_at > 1_600_000_000.0);
        assert!(manifest_line.starts_with("{\"created_at\": "));
        assert!(path.exists());
    }

    #[test]
    fn writes_update_manifest_line_lengths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(0));
        let mut segment = open_append(&path, 0);
        segment.write_record(&json!({"angle": 0.1})).unwrap();
        segment.write_record(&json!({"angle": -0.25, "throttle": 1})).unwrap();
        assert_eq!(segment.len(), 2);
        segment.close();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "{\"angle\": 0.1}\n{\"angle\": -0.25, \"throttle\": 1}\n"
        );
        let reopened = Segment::open(&path, 0, OpenMode::ReadOnly, ReadStrategy::Auto).unwrap();
        assert_eq!(reopened.manifest().line_lengths, vec![15, 32]);
    }

    #[test]
    fn reopen_uses_manifest_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(0));
        let mut segment = open_append(&path, 0);
        segment.write_record(&json!({"n": 1})).unwrap();
        segment.close();

        // An unindexed trailing record, as left by a crash between the data
        // write and the manifest update, stays invisible to readers.
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"n\": 2}\n").unwrap();
        drop(file);

        let mut reader = Segment::open(&path, 0, OpenMode::ReadOnly, ReadStrategy::Buffered).unwrap();
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.next_line().unwrap().as_deref(), Some("{\"n\": 1}"));
        assert_eq!(reader.next_line().unwrap(), None);
        reader.close();

        let mut writer = open_append(&path, 0);
        writer.write_record(&json!({"n": 3})).unwrap();
        writer.close();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"n\": 1}\n{\"n\": 3}\n");
    }

    #[test]
    fn read_record_by_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(0));
        let mut segment = open_append(&path, 0);
        for n in 0..3 {
            segment.write_record(&json!({ "n": n })).unwrap();
        }
        assert_eq!(segment.read_record(1).unwrap().unwrap()["n"], 1);
        assert_eq!(segment.read_record(3).unwrap(), None);
    }

    #[test]
    fn rejected_record_leaves_segment_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(0));
        let mut segment = open_append(&path, 0);
        segment.write_record(&json!({"ok": true})).unwrap();
        let err = segment
            .write_record(&std::collections::BTreeMap::from([("v", f64::NAN)]))
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert_eq!(segment.len(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"ok\": true}\n");
    }

    #[test]
    fn empty_manifest_in_read_only_mode_falls_back_to_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(0));
        fs::write(&path, "{\"a\": 1}\n{\"a\": 2}\n").unwrap();
        fs::write(segment_manifest_path(&path), "").unwrap();

        let segment = Segment::open(&path, 7, OpenMode::ReadOnly, ReadStrategy::Auto).unwrap();
        assert_eq!(segment.len(), 2);
        assert_eq!(segment.start_index(), 7);
    }

    #[test]
    fn malformed_manifest_is_a_segment_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(0));
        fs::write(&path, "").unwrap();
        fs::write(segment_manifest_path(&path), "{not json\n").unwrap();
        let err = Segment::open(&path, 0, OpenMode::ReadOnly, ReadStrategy::Auto).unwrap_err();
        assert!(matches!(err, Error::Segment(_)));
    }

    #[test]
    fn truncate_records_rewrites_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(0));
        let mut segment = open_append(&path, 0);
        for n in 0..4 {
            segment.write_record(&json!({ "n": n })).unwrap();
        }
        segment.truncate_records(2).unwrap();
        segment.close();

        let reopened = Segment::open(&path, 0, OpenMode::ReadOnly, ReadStrategy::Auto).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.manifest().line_lengths.len(), 2);
    }
}
