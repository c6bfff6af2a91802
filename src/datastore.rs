//! The tub datastore: an append-only, segmented log of JSON records.
//!
//! ## Layout
//!
//! ```text
//! <base>/manifest.json                 schema, metadata, sessions, segment index
//! <base>/segment_0.segment             records 0 .. max_len
//! <base>/segment_0.segment_manifest    line-length index of segment_0
//! <base>/segment_1.segment             records max_len .. 2 * max_len
//! ...
//! ```
//!
//! Each write appends one line to the last segment, rewrites that segment's
//! manifest and then rewrites line 5 of `manifest.json`. File handles are
//! held only for the duration of a single operation.
//!
//! ## Crash recovery
//!
//! The manifest is updated after the segment, so a crash in between leaves
//! records past `current_index` in the last segment. A writable open drops
//! them. A torn final line (no trailing newline) is dropped by the segment
//! itself.
//!
//! Deletion is soft: indexes go into `deleted_indexes` and are skipped by
//! iteration and excluded from [`Datastore::len`]. Records are never
//! compacted away.

use crate::error::{Error, Result};
use crate::iter::{DatastoreIterator, Indexed};
use crate::line_file::{OpenMode, ReadStrategy};
use crate::manifest::{
    self, MANIFEST_FILE_NAME, ManifestHeader, ManifestMetadata, SegmentIndex,
};
use crate::record::{Record, encode_record};
use crate::segment::{Segment, segment_file_name, unix_seconds_now};
use crate::session::{SessionHistory, SessionId};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::ops::{Range, RangeInclusive};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_SEGMENT_LEN: u64 = 1000;

/// Options for [`Datastore::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreOptions {
    /// Record field names. Empty means "adopt the stored schema".
    pub inputs: Vec<String>,
    /// Record field types, parallel to `inputs`.
    pub types: Vec<String>,
    /// `"key:value"` entries stored as user metadata of a new datastore.
    pub metadata: Vec<String>,
    /// Records per segment for a new datastore. An existing datastore keeps
    /// the value it was created with.
    pub max_segment_len: u64,
    pub read_only: bool,
    pub read_strategy: ReadStrategy,
}

impl Default for DatastoreOptions {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            types: Vec::new(),
            metadata: Vec::new(),
            max_segment_len: DEFAULT_MAX_SEGMENT_LEN,
            read_only: false,
            read_strategy: ReadStrategy::Auto,
        }
    }
}

impl DatastoreOptions {
    /// Options for reading an existing datastore.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_schema<I, T>(mut self, inputs: I, types: T) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_metadata<I>(mut self, metadata: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.metadata = metadata.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_max_segment_len(mut self, max_segment_len: u64) -> Self {
        self.max_segment_len = max_segment_len;
        self
    }

    #[must_use]
    pub const fn with_read_strategy(mut self, read_strategy: ReadStrategy) -> Self {
        self.read_strategy = read_strategy;
        self
    }
}

/// A set of logical record indexes, accepted by
/// [`Datastore::delete_records`] and [`Datastore::restore_records`].
///
/// Ranges are kept as bounds, so `0..u64::MAX` costs nothing until it is
/// clamped to the written records.
#[derive(Debug, Clone)]
pub struct IndexSet(Indexes);

#[derive(Debug, Clone)]
enum Indexes {
    Set(BTreeSet<u64>),
    /// Non-empty: `start <= end`.
    Span { start: u64, end: u64 },
}

impl IndexSet {
    /// `start..=end`, empty when `start > end`.
    fn span(start: u64, end: u64) -> Self {
        if start > end {
            Self::default()
        } else {
            Self(Indexes::Span { start, end })
        }
    }

    pub fn len(&self) -> usize {
        match &self.0 {
            Indexes::Set(set) => set.len(),
            Indexes::Span { start, end } => usize::try_from(end - start)
                .map_or(usize::MAX, |len| len.saturating_add(1)),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Indexes::Set(set) => set.is_empty(),
            Indexes::Span { .. } => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        let (set, span) = match &self.0 {
            Indexes::Set(set) => (Some(set.iter().copied()), None),
            Indexes::Span { start, end } => (None, Some(*start..=*end)),
        };
        set.into_iter().flatten().chain(span.into_iter().flatten())
    }

    fn bounds(&self) -> Option<(u64, u64)> {
        match &self.0 {
            Indexes::Set(set) => Some((*set.first()?, *set.last()?)),
            Indexes::Span { start, end } => Some((*start, *end)),
        }
    }

    /// Split into the indexes below `limit` and the rest.
    fn split_below(self, limit: u64) -> (Self, Self) {
        match self.0 {
            Indexes::Set(mut below) => {
                let above = below.split_off(&limit);
                (Self(Indexes::Set(below)), Self(Indexes::Set(above)))
            }
            Indexes::Span { start, end } => {
                let below = match limit.checked_sub(1) {
                    Some(last) => Self::span(start, end.min(last)),
                    None => Self::default(),
                };
                (below, Self::span(start.max(limit), end))
            }
        }
    }
}

impl PartialEq for IndexSet {
    fn eq(&self, other: &Self) -> bool {
        self.bounds() == other.bounds() && self.iter().eq(other.iter())
    }
}

impl Eq for IndexSet {}

impl Default for IndexSet {
    fn default() -> Self {
        Self(Indexes::Set(BTreeSet::new()))
    }
}

impl From<u64> for IndexSet {
    fn from(index: u64) -> Self {
        Self::span(index, index)
    }
}

impl<const N: usize> From<[u64; N]> for IndexSet {
    fn from(indexes: [u64; N]) -> Self {
        indexes.into_iter().collect()
    }
}

impl From<&[u64]> for IndexSet {
    fn from(indexes: &[u64]) -> Self {
        indexes.iter().copied().collect()
    }
}

impl From<Vec<u64>> for IndexSet {
    fn from(indexes: Vec<u64>) -> Self {
        indexes.into_iter().collect()
    }
}

impl From<BTreeSet<u64>> for IndexSet {
    fn from(indexes: BTreeSet<u64>) -> Self {
        Self(Indexes::Set(indexes))
    }
}

impl From<HashSet<u64>> for IndexSet {
    fn from(indexes: HashSet<u64>) -> Self {
        indexes.into_iter().collect()
    }
}

impl From<Range<u64>> for IndexSet {
    fn from(indexes: Range<u64>) -> Self {
        match indexes.end.checked_sub(1) {
            Some(last) => Self::span(indexes.start, last),
            None => Self::default(),
        }
    }
}

impl From<RangeInclusive<u64>> for IndexSet {
    fn from(indexes: RangeInclusive<u64>) -> Self {
        if indexes.is_empty() {
            return Self::default();
        }
        let (start, end) = indexes.into_inner();
        Self::span(start, end)
    }
}

impl FromIterator<u64> for IndexSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self(Indexes::Set(iter.into_iter().collect()))
    }
}

#[derive(Debug)]
pub struct Datastore {
    base_path: PathBuf,
    manifest_path: PathBuf,
    inputs: Vec<String>,
    types: Vec<String>,
    metadata: Map<String, Value>,
    manifest_metadata: ManifestMetadata,
    segment_paths: Vec<String>,
    current_index: u64,
    deleted_indexes: BTreeSet<u64>,
    max_segment_len: u64,
    read_only: bool,
    read_strategy: ReadStrategy,
    session_id: SessionId,
    /// At least one record was written in this session.
    session_dirty: bool,
    closed: bool,
}

impl Datastore {
    /// Whether `base_path` holds a datastore manifest.
    pub fn exists(base_path: impl AsRef<Path>) -> bool {
        base_path.as_ref().join(MANIFEST_FILE_NAME).is_file()
    }

    /// Open the datastore at `base_path`, creating it unless `read_only`.
    pub fn open(base_path: impl AsRef<Path>, options: DatastoreOptions) -> Result<Self> {
        if options.max_segment_len == 0 {
            return Err(Error::validation("max_segment_len must be at least 1"));
        }
        let base_path = std::path::absolute(base_path.as_ref())?;
        let manifest_path = base_path.join(MANIFEST_FILE_NAME);

        let mut store = Self {
            manifest_path,
            inputs: options.inputs,
            types: options.types,
            metadata: parse_metadata(&options.metadata),
            manifest_metadata: ManifestMetadata::default(),
            segment_paths: Vec::new(),
            current_index: 0,
            deleted_indexes: BTreeSet::new(),
            max_segment_len: options.max_segment_len,
            read_only: options.read_only,
            read_strategy: options.read_strategy,
            session_id: SessionId::next(None),
            session_dirty: false,
            // Flipped once open succeeds, so an early return drops quietly.
            closed: true,
            base_path,
        };

        match ManifestHeader::read(&store.manifest_path, store.read_strategy)? {
            Some(header) => {
                store.adopt(header)?;
                tracing::info!(path = %store.base_path.display(), "Found datastore");
            }
            None if store.read_only => {
                return Err(Error::DatastoreNotFound {
                    path: store.base_path.display().to_string(),
                });
            }
            None => {
                std::fs::create_dir_all(&store.base_path)?;
                store.manifest_metadata.created_at = Some(unix_seconds_now());
                tracing::info!(path = %store.base_path.display(), "Creating a new datastore");
            }
        }

        if store.segment_paths.is_empty() {
            if !store.read_only {
                store.write_header()?;
                store.add_segment()?;
            }
        } else if !store.read_only {
            store.reconcile_last_segment()?;
        }

        store.session_id = SessionId::next(store.manifest_metadata.sessions.as_ref());
        store.closed = false;
        Ok(store)
    }

    /// Append one record. `record` must serialize to a JSON object without
    /// non-finite floats; a rejected record leaves the datastore unchanged.
    pub fn write_record<T: Serialize + ?Sized>(&mut self, record: &T) -> Result<()> {
        self.ensure_writable()?;
        let line = encode_record(record)?;

        if self.current_index > 0 && self.current_index % self.max_segment_len == 0 {
            self.add_segment()?;
        }
        let mut segment = self.open_last_segment()?;
        let written = segment.write_encoded(&line);
        segment.close();
        written?;

        self.current_index += 1;
        self.persist_segment_index()?;
        self.session_dirty = true;
        Ok(())
    }

    /// Mark records as deleted. Indexes never written are ignored.
    pub fn delete_records(&mut self, indexes: impl Into<IndexSet>) -> Result<()> {
        self.ensure_writable()?;
        let indexes = self.written_only(indexes.into());
        self.deleted_indexes.extend(indexes.iter());
        self.persist_segment_index()?;
        if let Some((first, last)) = indexes.bounds() {
            tracing::info!(count = indexes.len(), first, last, "Deleting records");
        }
        Ok(())
    }

    /// Undo [`Self::delete_records`].
    pub fn restore_records(&mut self, indexes: impl Into<IndexSet>) -> Result<()> {
        self.ensure_writable()?;
        let indexes = self.written_only(indexes.into());
        for index in indexes.iter() {
            self.deleted_indexes.remove(&index);
        }
        self.persist_segment_index()?;
        if let Some((first, last)) = indexes.bounds() {
            tracing::info!(count = indexes.len(), first, last, "Restored records");
        }
        Ok(())
    }

    /// Record at logical `index`, deleted or not. `None` if it was never
    /// written.
    pub fn read_record(&self, index: u64) -> Result<Option<Record>> {
        if index >= self.current_index || self.segment_paths.is_empty() {
            return Ok(None);
        }

        // Segments hold max_len records unless max_len changed over the
        // datastore's history, so try the arithmetic guess first.
        let guess = usize::try_from(index / self.max_segment_len)
            .unwrap_or(usize::MAX)
            .min(self.segment_paths.len() - 1);
        let order = std::iter::once(guess)
            .chain((0..self.segment_paths.len()).filter(|&seq| seq != guess));
        for seq in order {
            let mut segment = self.open_segment(seq, OpenMode::ReadOnly)?;
            let start = segment.start_index();
            let end = start.saturating_add(segment.len() as u64);
            if (start..end).contains(&index) {
                let offset = usize::try_from(index - start)
                    .map_err(|_| Error::validation("record offset exceeds usize"))?;
                let record = segment.read_record(offset);
                segment.close();
                return record;
            }
            segment.close();
        }
        Ok(None)
    }

    /// Iterate live records in index order.
    pub fn iter(&self) -> DatastoreIterator<'_> {
        DatastoreIterator::borrowed(self)
    }

    /// Iterate live records together with their logical index.
    pub fn iter_indexed(&self) -> Indexed<'_> {
        self.iter().indexed()
    }

    pub fn is_deleted(&self, index: u64) -> bool {
        self.deleted_indexes.contains(&index)
    }

    pub const fn deleted_indexes(&self) -> &BTreeSet<u64> {
        &self.deleted_indexes
    }

    /// Logical index the next record will get.
    pub const fn current_index(&self) -> u64 {
        self.current_index
    }

    /// Number of live (not deleted) records.
    pub fn len(&self) -> usize {
        let live = self
            .current_index
            .saturating_sub(self.deleted_indexes.len() as u64);
        usize::try_from(live).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn types(&self) -> &[String] {
        &self.types
    }

    pub const fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub const fn manifest_metadata(&self) -> &ManifestMetadata {
        &self.manifest_metadata
    }

    pub fn sessions(&self) -> Option<&SessionHistory> {
        self.manifest_metadata.sessions.as_ref()
    }

    /// Segment file names relative to [`Self::base_path`], in order.
    pub fn segment_paths(&self) -> &[String] {
        &self.segment_paths
    }

    pub const fn max_segment_len(&self) -> u64 {
        self.max_segment_len
    }

    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub const fn read_strategy(&self) -> ReadStrategy {
        self.read_strategy
    }

    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Set a user metadata entry in memory; see [`Self::write_metadata`].
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Persist user and manifest metadata (manifest lines 3 and 4).
    pub fn write_metadata(&mut self) -> Result<()> {
        self.ensure_writable()?;
        manifest::write_metadata(&self.manifest_path, &self.metadata, &self.manifest_metadata)
    }

    /// Save the session if records were written and mark the datastore
    /// closed. Failures are logged, not returned. Repeated calls are no-ops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.manifest_path.exists() {
            tracing::debug!(
                path = %self.manifest_path.display(),
                "manifest removed before close; nothing to save"
            );
            return;
        }
        if self.session_dirty && !self.read_only {
            tracing::info!(session = %self.session_id, "Saving new session");
            self.manifest_metadata
                .sessions
                .get_or_insert_with(SessionHistory::default)
                .record(&self.session_id);
            if let Err(err) = manifest::write_metadata(
                &self.manifest_path,
                &self.metadata,
                &self.manifest_metadata,
            ) {
                tracing::warn!(
                    path = %self.manifest_path.display(),
                    error = %err,
                    "failed to save session metadata on close"
                );
            }
            self.session_dirty = false;
        }
        tracing::info!(path = %self.base_path.display(), "Closing datastore");
    }

    fn adopt(&mut self, header: ManifestHeader) -> Result<()> {
        if self.inputs.is_empty() && self.types.is_empty() {
            self.inputs = header.inputs;
            self.types = header.types;
        } else if self.inputs != header.inputs || self.types != header.types {
            return Err(Error::SchemaMismatch {
                inputs: std::mem::take(&mut self.inputs),
                types: std::mem::take(&mut self.types),
                stored_inputs: header.inputs,
                stored_types: header.types,
            });
        }
        self.metadata = header.metadata;
        self.manifest_metadata = header.manifest_metadata;

        let index = header.segment_index;
        self.segment_paths = index.paths;
        self.current_index = index.current_index;
        if index.max_len > 0 {
            self.max_segment_len = index.max_len;
        }
        self.deleted_indexes = index.deleted_indexes.into_iter().collect();
        Ok(())
    }

    /// Drop records the manifest does not know about from the last segment.
    fn reconcile_last_segment(&mut self) -> Result<()> {
        let mut segment = self.open_last_segment()?;
        tracing::info!(path = %segment.path().display(), "Using last segment");
        let expected = self.current_index.saturating_sub(segment.start_index());
        let found = segment.len() as u64;
        if found > expected {
            tracing::warn!(
                path = %segment.path().display(),
                expected,
                found,
                "segment has records past the manifest's current index; truncating"
            );
            let keep = usize::try_from(expected)
                .map_err(|_| Error::validation("segment length exceeds usize"))?;
            segment.truncate_records(keep)?;
        } else if found < expected {
            tracing::warn!(
                path = %segment.path().display(),
                expected,
                found,
                "segment is missing records the manifest counts"
            );
        }
        segment.close();
        Ok(())
    }

    fn write_header(&self) -> Result<()> {
        let header = ManifestHeader {
            inputs: self.inputs.clone(),
            types: self.types.clone(),
            metadata: self.metadata.clone(),
            manifest_metadata: self.manifest_metadata.clone(),
            segment_index: self.segment_index(),
        };
        header.write(&self.manifest_path)
    }

    fn add_segment(&mut self) -> Result<()> {
        let name = segment_file_name(self.segment_paths.len());
        let path = self.base_path.join(&name);
        let mut segment = Segment::open(
            &path,
            self.current_index,
            OpenMode::Append,
            self.read_strategy,
        )?;
        segment.close();
        tracing::debug!(
            path = %path.display(),
            start_index = self.current_index,
            "Created segment"
        );
        self.segment_paths.push(name);
        self.persist_segment_index()
    }

    pub(crate) fn open_segment(&self, seq: usize, mode: OpenMode) -> Result<Segment> {
        let name = self.segment_paths.get(seq).ok_or_else(|| {
            Error::manifest(format!(
                "segment {seq} not listed in {}",
                self.manifest_path.display()
            ))
        })?;
        // Only consulted when the segment manifest is missing or empty.
        let start_index = (seq as u64).saturating_mul(self.max_segment_len);
        Segment::open(self.base_path.join(name), start_index, mode, self.read_strategy)
    }

    fn open_last_segment(&self) -> Result<Segment> {
        let last = self
            .segment_paths
            .len()
            .checked_sub(1)
            .ok_or_else(|| Error::manifest("datastore has no segments"))?;
        self.open_segment(last, OpenMode::Append)
    }

    fn segment_index(&self) -> SegmentIndex {
        SegmentIndex {
            paths: self.segment_paths.clone(),
            current_index: self.current_index,
            max_len: self.max_segment_len,
            deleted_indexes: self.deleted_indexes.iter().copied().collect(),
        }
    }

    fn persist_segment_index(&self) -> Result<()> {
        manifest::write_segment_index(&self.manifest_path, &self.segment_index())
    }

    fn written_only(&self, indexes: IndexSet) -> IndexSet {
        let (written, unwritten) = indexes.split_below(self.current_index);
        if let Some((first, last)) = unwritten.bounds() {
            tracing::warn!(
                count = unwritten.len(),
                first,
                last,
                current_index = self.current_index,
                "ignoring records that were never written"
            );
        }
        written
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::read_only(&self.base_path));
        }
        if self.closed {
            return Err(Error::validation(format!(
                "datastore {} is closed",
                self.base_path.display()
            )));
        }
        Ok(())
    }
}

impl Drop for Datastore {
    fn drop(&mut self) {
        self.close();
    }
}

impl<'a> IntoIterator for &'a Datastore {
    type Item = Result<Record>;
    type IntoIter = DatastoreIterator<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for Datastore {
    type Item = Result<Record>;
    type IntoIter = DatastoreIterator<'static>;

    /// Iterate and close the datastore once the records run out.
    fn into_iter(self) -> Self::IntoIter {
        DatastoreIterator::owned(self)
    }
}

/// Parse `"key:value"` entries. Anything else is logged and skipped.
fn parse_metadata(entries: &[String]) -> Map<String, Value> {
    let mut metadata = Map::new();
    for entry in entries {
        let parts: Vec<&str> = entry.split(':').collect();
        if let [key, value] = parts.as_slice() {
            metadata.insert((*key).to_string(), Value::String((*value).to_string()));
        } else {
            tracing::error!(
                entry = %entry,
                "Metadata item needs to be a key value pair of format key:value, ignoring entry"
            );
        }
    }
    metadata
}
