//! The datastore's `manifest.json`.
//!
//! Five JSON lines, each independently rewritable:
//!
//! ```text
//! 1  ["cam/image_array", "user/angle"]          inputs
//! 2  ["image_array", "float"]                   types
//! 3  {"vehicle": "donkey2"}                     user metadata
//! 4  {"created_at": ..., "sessions": {...}}     manifest metadata
//! 5  {"paths": [...], "current_index": 7, "max_len": 1000, "deleted_indexes": [3]}
//! ```
//!
//! Line 5 changes on every write and is rewritten by truncating the file
//! after line 4. Lines 3 and 4 change on metadata updates and session close.

use crate::error::{Error, Result};
use crate::line_file::{LineIndexedFile, OpenMode, ReadStrategy};
use crate::record::to_line;
use crate::session::SessionHistory;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

const INPUTS_LINE: usize = 1;
const TYPES_LINE: usize = 2;
const METADATA_LINE: usize = 3;
const MANIFEST_METADATA_LINE: usize = 4;
const SEGMENT_INDEX_LINE: usize = 5;

/// Line 4: bookkeeping owned by the datastore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<SessionHistory>,
    /// Keys written by other tooling, preserved as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Line 5: the segment index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIndex {
    /// Segment file names relative to the datastore directory, in order.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Logical index the next record will get.
    #[serde(default)]
    pub current_index: u64,
    #[serde(default)]
    pub max_len: u64,
    /// Sorted ascending.
    #[serde(default)]
    pub deleted_indexes: Vec<u64>,
}

/// All five manifest lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestHeader {
    pub inputs: Vec<String>,
    pub types: Vec<String>,
    pub metadata: Map<String, Value>,
    pub manifest_metadata: ManifestMetadata,
    pub segment_index: SegmentIndex,
}

impl ManifestHeader {
    /// Read the manifest at `path`. `Ok(None)` when the file is missing or
    /// empty, which the datastore treats as "not created yet".
    pub fn read(path: &Path, strategy: ReadStrategy) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = LineIndexedFile::open(path, OpenMode::ReadOnly, None, strategy)?;
        if !file.has_content() {
            return Ok(None);
        }
        if file.lines() < SEGMENT_INDEX_LINE {
            return Err(Error::manifest(format!(
                "{} has {} lines, expected {SEGMENT_INDEX_LINE}",
                path.display(),
                file.lines()
            )));
        }

        let header = Self {
            inputs: parse_line(&mut file, INPUTS_LINE, "inputs")?,
            types: parse_line(&mut file, TYPES_LINE, "types")?,
            metadata: parse_line(&mut file, METADATA_LINE, "metadata")?,
            manifest_metadata: parse_line(&mut file, MANIFEST_METADATA_LINE, "manifest metadata")?,
            segment_index: parse_line(&mut file, SEGMENT_INDEX_LINE, "segment index")?,
        };
        file.close();
        Ok(Some(header))
    }

    /// Replace the whole manifest with this header.
    pub fn write(&self, path: &Path) -> Result<()> {
        let lines = [
            to_line(&self.inputs)?,
            to_line(&self.types)?,
            to_line(&self.metadata)?,
            to_line(&self.manifest_metadata)?,
            to_line(&self.segment_index)?,
        ];
        let mut file = open_for_update(path)?;
        file.truncate_from(0)?;
        for line in &lines {
            file.append(line)?;
        }
        file.close();
        Ok(())
    }
}

/// Rewrite line 5 only.
pub fn write_segment_index(path: &Path, index: &SegmentIndex) -> Result<()> {
    let line = to_line(index)?;
    let mut file = open_for_update(path)?;
    ensure_header_lines(&file, MANIFEST_METADATA_LINE)?;
    file.truncate_from(MANIFEST_METADATA_LINE)?;
    file.append(&line)?;
    file.close();
    Ok(())
}

/// Rewrite lines 3 and 4 in place.
pub fn write_metadata(
    path: &Path,
    metadata: &Map<String, Value>,
    manifest_metadata: &ManifestMetadata,
) -> Result<()> {
    let metadata_line = to_line(metadata)?;
    let manifest_metadata_line = to_line(manifest_metadata)?;
    let mut file = open_for_update(path)?;
    ensure_header_lines(&file, SEGMENT_INDEX_LINE)?;
    file.replace_line(METADATA_LINE, &metadata_line)?;
    file.replace_line(MANIFEST_METADATA_LINE, &manifest_metadata_line)?;
    file.close();
    Ok(())
}

fn open_for_update(path: &Path) -> Result<LineIndexedFile> {
    LineIndexedFile::open(path, OpenMode::Append, None, ReadStrategy::Buffered)
}

fn ensure_header_lines(file: &LineIndexedFile, expected: usize) -> Result<()> {
    if file.lines() < expected {
        return Err(Error::manifest(format!(
            "{} has {} lines, expected at least {expected}",
            file.path().display(),
            file.lines()
        )));
    }
    Ok(())
}

fn parse_line<T: DeserializeOwned>(
    file: &mut LineIndexedFile,
    line_number: usize,
    what: &str,
) -> Result<T> {
    let line = file.read_line_at(line_number)?;
    serde_json::from_str(&line).map_err(|err| {
        Error::manifest(format!(
            "malformed {what} on line {line_number} of {}: {err}",
            file.path().display()
        ))
    })
}
