//! Newline-delimited files with an in-memory line-length index.
//!
//! A [`LineIndexedFile`] remembers the byte length of every line it holds, so
//! seeking to line `n` is a single prefix-sum lookup instead of a scan. The
//! index is either rebuilt by scanning the file on open, or restored from a
//! previously persisted list of line lengths (the segment manifests do this).
//!
//! Large data files are only ever appended to. Small files (manifests) may be
//! rewritten in place with [`LineIndexedFile::replace_line`], which costs
//! O(remaining lines).

use crate::error::{Error, Result};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const NEWLINE: u8 = b'\n';

/// Whether an open read-only mapping keeps the mapped file from being removed.
const MAPPING_BLOCKS_DELETION: bool = cfg!(windows);

/// How read-only files are read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadStrategy {
    /// Pick by platform capability, see [`ReadStrategy::resolve`].
    #[default]
    Auto,
    /// Memory-map read-only files.
    Mapped,
    /// Positional reads through the file handle.
    Buffered,
}

impl ReadStrategy {
    /// Resolve `Auto` to a concrete strategy. Mapping is only used where an
    /// open mapping does not block deletion of the underlying file.
    pub const fn resolve(self) -> Self {
        match self {
            Self::Auto => {
                if MAPPING_BLOCKS_DELETION {
                    Self::Buffered
                } else {
                    Self::Mapped
                }
            }
            other => other,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Mapped => "mapped",
            Self::Buffered => "buffered",
        }
    }
}

impl FromStr for ReadStrategy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "mapped" | "mmap" => Ok(Self::Mapped),
            "buffered" | "file" => Ok(Self::Buffered),
            other => Err(Error::config(format!(
                "unknown read strategy '{other}' (expected auto, mapped or buffered)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    /// Read and append; creates the file if missing.
    Append,
}

#[derive(Debug)]
enum Backing {
    Mapped(Mmap),
    File(File),
}

#[derive(Debug)]
pub struct LineIndexedFile {
    path: PathBuf,
    mode: OpenMode,
    backing: Option<Backing>,
    line_lengths: Vec<u64>,
    /// `cumulative_lengths[i] == line_lengths[..=i].sum()`
    cumulative_lengths: Vec<u64>,
    total_length: u64,
    /// Zero-based index of the line [`Self::next_line`] returns.
    cursor: usize,
}

impl LineIndexedFile {
    /// Open `path`. When `line_lengths` is `Some` and non-empty the index is
    /// restored from it, otherwise the file is scanned.
    pub fn open(
        path: impl AsRef<Path>,
        mode: OpenMode,
        line_lengths: Option<&[u64]>,
        strategy: ReadStrategy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = match mode {
            OpenMode::ReadOnly => File::open(&path)?,
            OpenMode::Append => OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?,
        };
        let file_len = file.metadata()?.len();

        let mut this = Self {
            path,
            mode,
            backing: None,
            line_lengths: Vec::new(),
            cumulative_lengths: Vec::new(),
            total_length: 0,
            cursor: 0,
        };

        match line_lengths.filter(|lengths| !lengths.is_empty()) {
            Some(lengths) => {
                this.restore_index(lengths);
                if file_len < this.total_length {
                    tracing::warn!(
                        path = %this.path.display(),
                        file_len,
                        indexed_len = this.total_length,
                        "line index is longer than the file; rescanning"
                    );
                    this.scan(&file)?;
                } else if file_len > this.total_length && mode == OpenMode::Append {
                    tracing::warn!(
                        path = %this.path.display(),
                        file_len,
                        indexed_len = this.total_length,
                        "dropping unindexed trailing bytes"
                    );
                    file.set_len(this.total_length)?;
                }
            }
            None => this.scan(&file)?,
        }

        let backing = if mode == OpenMode::ReadOnly
            && strategy.resolve() == ReadStrategy::Mapped
            && file_len > 0
        {
            Backing::Mapped(map_read_only(&file)?)
        } else {
            Backing::File(file)
        };
        this.backing = Some(backing);
        Ok(this)
    }

    fn restore_index(&mut self, lengths: &[u64]) {
        self.line_lengths.clear();
        self.cumulative_lengths.clear();
        self.total_length = 0;
        for &length in lengths {
            self.push_length(length);
        }
    }

    fn push_length(&mut self, length: u64) {
        self.total_length = self.total_length.saturating_add(length);
        self.line_lengths.push(length);
        self.cumulative_lengths.push(self.total_length);
    }

    fn scan(&mut self, file: &File) -> Result<()> {
        self.restore_index(&[]);
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        let mut missing_newline = false;
        loop {
            buf.clear();
            let bytes_read = reader.read_until(NEWLINE, &mut buf)?;
            if bytes_read == 0 {
                break;
            }
            missing_newline = buf.last() != Some(&NEWLINE);
            let length = u64::try_from(bytes_read)
                .map_err(|_| Error::validation("line length exceeds u64"))?;
            self.push_length(length);
        }

        // A partial last line is the remains of an interrupted append. It
        // has to go before anything else is appended behind it.
        if missing_newline && self.mode == OpenMode::Append {
            let dropped = self.line_lengths.len();
            tracing::warn!(
                path = %self.path.display(),
                line = dropped,
                "dropping newline-missing trailing line"
            );
            self.line_lengths.pop();
            self.cumulative_lengths.pop();
            self.total_length = self.cumulative_lengths.last().copied().unwrap_or(0);
            file.set_len(self.total_length)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Number of indexed lines.
    pub fn lines(&self) -> usize {
        self.line_lengths.len()
    }

    pub fn has_content(&self) -> bool {
        !self.line_lengths.is_empty()
    }

    pub fn line_lengths(&self) -> &[u64] {
        &self.line_lengths
    }

    pub const fn total_length(&self) -> u64 {
        self.total_length
    }

    pub const fn is_closed(&self) -> bool {
        self.backing.is_none()
    }

    pub const fn is_mapped(&self) -> bool {
        matches!(self.backing, Some(Backing::Mapped(_)))
    }

    /// Append one line, adding the trailing newline if it is missing.
    pub fn append(&mut self, contents: &str) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::read_only(&self.path));
        }
        let mut line = Vec::with_capacity(contents.len() + 1);
        line.extend_from_slice(contents.as_bytes());
        if line.last() != Some(&NEWLINE) {
            line.push(NEWLINE);
        }
        let length =
            u64::try_from(line.len()).map_err(|_| Error::validation("line length exceeds u64"))?;

        let total_length = self.total_length;
        let file = self.writable_file()?;
        file.seek(SeekFrom::Start(total_length))?;
        if let Err(err) = file.write_all(&line).and_then(|()| file.flush()) {
            // Keep the file and the index in agreement.
            let _ = file.set_len(total_length);
            return Err(Error::from(err));
        }
        self.push_length(length);
        Ok(())
    }

    /// Content of line `n` (1-based), without its line terminator. Empty at
    /// or after the end of the file. Leaves the cursor after line `n`.
    pub fn read_line_at(&mut self, line_number: usize) -> Result<String> {
        if line_number == 0 || line_number > self.lines() {
            self.cursor = self.lines();
            return Ok(String::new());
        }
        let contents = self.read_indexed_line(line_number - 1)?;
        self.cursor = line_number;
        Ok(contents)
    }

    /// Position the cursor at the start of line `n` (1-based).
    pub fn seek_line_start(&mut self, line_number: usize) {
        self.cursor = line_number.saturating_sub(1).min(self.lines());
    }

    /// Read the line under the cursor and advance. `None` at end of file.
    pub fn next_line(&mut self) -> Result<Option<String>> {
        self.next_raw_line()?.map(decode_line).transpose()
    }

    /// Like [`Self::next_line`] but without UTF-8 validation. The cursor
    /// advances even if the read fails.
    pub fn next_raw_line(&mut self) -> Result<Option<Vec<u8>>> {
        if self.cursor >= self.lines() {
            return Ok(None);
        }
        let index = self.cursor;
        self.cursor += 1;
        self.read_indexed_bytes(index).map(Some)
    }

    /// All lines from `n` (1-based) to the end. The cursor is not moved.
    pub fn read_from(&mut self, line_number: usize) -> Result<Vec<String>> {
        let first = line_number.saturating_sub(1);
        let saved = self.cursor;
        let lines = (first..self.lines())
            .map(|index| self.read_indexed_line(index))
            .collect::<Result<Vec<_>>>();
        self.cursor = saved;
        lines
    }

    /// Keep lines `1..=n` and drop everything after them, on disk and in the
    /// index. `truncate_from(0)` empties the file.
    pub fn truncate_from(&mut self, line_number: usize) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::read_only(&self.path));
        }
        let keep = line_number.min(self.lines());
        self.line_lengths.truncate(keep);
        self.cumulative_lengths.truncate(keep);
        self.total_length = self.cumulative_lengths.last().copied().unwrap_or(0);
        self.cursor = self.cursor.min(keep);
        let total_length = self.total_length;
        self.writable_file()?.set_len(total_length)?;
        Ok(())
    }

    /// Replace line `n` (1-based) by truncating from it and re-appending the
    /// lines that followed. `n == lines() + 1` appends.
    pub fn replace_line(&mut self, line_number: usize, contents: &str) -> Result<()> {
        if line_number == 0 || line_number > self.lines() + 1 {
            return Err(Error::validation(format!(
                "cannot replace line {line_number} of {} ({} lines)",
                self.path.display(),
                self.lines()
            )));
        }
        let following = self.read_from(line_number)?;
        self.truncate_from(line_number - 1)?;
        self.append(contents)?;
        for line in following.iter().skip(1) {
            self.append(line)?;
        }
        Ok(())
    }

    /// Release the underlying handle or mapping. Repeated calls are no-ops.
    pub fn close(&mut self) {
        if let Some(Backing::File(mut file)) = self.backing.take() {
            if let Err(err) = file.flush() {
                tracing::warn!(path = %self.path.display(), error = %err, "flush on close failed");
            }
        }
    }

    fn writable_file(&mut self) -> Result<&mut File> {
        match self.backing.as_mut() {
            Some(Backing::File(file)) => Ok(file),
            Some(Backing::Mapped(_)) => Err(Error::read_only(&self.path)),
            None => Err(closed_error(&self.path)),
        }
    }

    fn line_span(&self, index: usize) -> (u64, u64) {
        let start = if index == 0 {
            0
        } else {
            self.cumulative_lengths[index - 1]
        };
        (start, self.line_lengths[index])
    }

    fn read_indexed_line(&mut self, index: usize) -> Result<String> {
        self.read_indexed_bytes(index).and_then(decode_line)
    }

    fn read_indexed_bytes(&mut self, index: usize) -> Result<Vec<u8>> {
        let (start, length) = self.line_span(index);
        let bytes = match self.backing.as_mut() {
            Some(Backing::Mapped(map)) => {
                let start = usize::try_from(start)
                    .map_err(|_| Error::validation("line offset exceeds usize"))?
                    .min(map.len());
                let end = usize::try_from(length)
                    .map_err(|_| Error::validation("line length exceeds usize"))?
                    .saturating_add(start)
                    .min(map.len());
                map[start..end].to_vec()
            }
            Some(Backing::File(file)) => {
                file.seek(SeekFrom::Start(start))?;
                let mut buf = Vec::new();
                Read::by_ref(file).take(length).read_to_end(&mut buf)?;
                buf
            }
            None => return Err(closed_error(&self.path)),
        };
        Ok(strip_terminator(bytes))
    }
}

impl Drop for LineIndexedFile {
    fn drop(&mut self) {
        self.close();
    }
}

fn strip_terminator(mut bytes: Vec<u8>) -> Vec<u8> {
    while matches!(bytes.last(), Some(b'\r' | b'\n')) {
        bytes.pop();
    }
    bytes
}

fn decode_line(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err).into())
}

fn closed_error(path: &Path) -> Error {
    Error::from(std::io::Error::other(format!(
        "{} is already closed",
        path.display()
    )))
}

#[allow(unsafe_code)]
fn map_read_only(file: &File) -> Result<Mmap> {
    // SAFETY: the file is opened read-only and data files are append-only, so
    // bytes inside the mapped range are never rewritten while mapped.
    let map = unsafe { Mmap::map(file)? };
    Ok(map)
}
