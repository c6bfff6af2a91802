//! Sequential iteration over a datastore's live records.

use crate::datastore::Datastore;
use crate::error::Result;
use crate::line_file::OpenMode;
use crate::record::{Record, decode_record_bytes};
use crate::segment::Segment;
use std::iter::FusedIterator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterState {
    /// The datastore lists no segments; nothing to yield.
    NoSegments,
    ReadingSegment,
    Exhausted,
}

#[derive(Debug)]
enum Source<'a> {
    Borrowed(&'a Datastore),
    Owned(Datastore),
}

impl Source<'_> {
    const fn store(&self) -> &Datastore {
        match self {
            Self::Borrowed(store) => store,
            Self::Owned(store) => store,
        }
    }
}

/// Walks segments in order, reading each read-only, counting logical indexes
/// from 0 and skipping deleted ones. Lines that fail to decode are logged
/// and skipped. An I/O error is yielded once and ends the iteration.
///
/// Not restartable: call [`Datastore::iter`] again for a fresh pass.
#[derive(Debug)]
pub struct DatastoreIterator<'a> {
    source: Source<'a>,
    state: IterState,
    segment_seq: usize,
    segment: Option<Segment>,
    next_index: u64,
}

impl<'a> DatastoreIterator<'a> {
    pub(crate) fn borrowed(store: &'a Datastore) -> Self {
        Self::new(Source::Borrowed(store))
    }

    fn new(source: Source<'a>) -> Self {
        let state = if source.store().segment_paths().is_empty() {
            IterState::NoSegments
        } else {
            IterState::ReadingSegment
        };
        Self {
            source,
            state,
            segment_seq: 0,
            segment: None,
            next_index: 0,
        }
    }

    pub const fn state(&self) -> IterState {
        self.state
    }

    /// Yield `(logical index, record)` pairs instead of bare records.
    pub fn indexed(self) -> Indexed<'a> {
        Indexed(self)
    }

    /// Next live record together with its logical index.
    pub fn next_indexed(&mut self) -> Option<Result<(u64, Record)>> {
        loop {
            if self.state != IterState::ReadingSegment {
                self.finish();
                return None;
            }
            if self.segment.is_none() {
                match self.open_next_segment() {
                    Ok(Some(segment)) => self.segment = Some(segment),
                    Ok(None) => {
                        self.state = IterState::Exhausted;
                        continue;
                    }
                    Err(err) => {
                        self.state = IterState::Exhausted;
                        self.finish();
                        return Some(Err(err));
                    }
                }
            }
            if self.next_index >= self.source.store().current_index() {
                // Lines past the committed index were never recorded in the
                // manifest.
                self.state = IterState::Exhausted;
                continue;
            }
            let Some(segment) = self.segment.as_mut() else {
                continue;
            };

            let line = match segment.next_raw_line() {
                Ok(line) => line,
                Err(err) => {
                    self.state = IterState::Exhausted;
                    self.finish();
                    return Some(Err(err));
                }
            };
            let Some(contents) = line else {
                self.close_segment();
                self.segment_seq += 1;
                continue;
            };

            let index = self.next_index;
            self.next_index += 1;
            if self.source.store().is_deleted(index) {
                continue;
            }
            match decode_record_bytes(&contents) {
                Ok(record) => return Some(Ok((index, record))),
                Err(err) => {
                    tracing::error!(index, error = %err, "Failed loading record; skipping");
                }
            }
        }
    }

    fn open_next_segment(&self) -> Result<Option<Segment>> {
        let store = self.source.store();
        if self.segment_seq >= store.segment_paths().len() {
            return Ok(None);
        }
        let mut segment = store.open_segment(self.segment_seq, OpenMode::ReadOnly)?;
        segment.rewind();
        Ok(Some(segment))
    }

    fn close_segment(&mut self) {
        if let Some(mut segment) = self.segment.take() {
            segment.close();
        }
    }

    /// Release the current segment and close an owned datastore.
    fn finish(&mut self) {
        self.close_segment();
        if let Source::Owned(store) = &mut self.source {
            store.close();
        }
    }
}

impl DatastoreIterator<'static> {
    pub(crate) fn owned(store: Datastore) -> Self {
        Self::new(Source::Owned(store))
    }
}

impl Iterator for DatastoreIterator<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_indexed()
            .map(|item| item.map(|(_, record)| record))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.state {
            IterState::ReadingSegment => (0, Some(self.source.store().len())),
            IterState::NoSegments | IterState::Exhausted => (0, Some(0)),
        }
    }
}

impl FusedIterator for DatastoreIterator<'_> {}

/// [`DatastoreIterator`] yielding `(logical index, record)`.
#[derive(Debug)]
pub struct Indexed<'a>(DatastoreIterator<'a>);

impl Iterator for Indexed<'_> {
    type Item = Result<(u64, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next_indexed()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl FusedIterator for Indexed<'_> {}
