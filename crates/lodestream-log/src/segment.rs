//! Log segments: a paired `.log` data file and `.index` offset index
//! covering one contiguous offset range.
//!
//! The data directory must be exclusive to the owning process. Segment reads
//! go through memory maps, so external modification of the files while the
//! log is open can cause undefined behavior including SIGBUS.

use chrono::Utc;
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::index::{Entry, Index, DEFAULT_INDEX_BYTES};
use crate::message::{decode_message, encode_message_set, entries_for_message_set, Message};
use crate::{Error, Result};

pub(crate) const LOG_SUFFIX: &str = ".log";
pub(crate) const INDEX_SUFFIX: &str = ".index";
/// Suffix carried by replacement segments until they are renamed over the
/// originals. Stray files with this suffix are removed on open.
pub(crate) const TRUNCATED_SUFFIX: &str = ".truncated";

/// One contiguous offset range `[base_offset, next_offset)` of the log on
/// disk. All but the trailing segment of a log are sealed.
#[derive(Debug)]
pub struct Segment {
    base_offset: i64,
    max_bytes: u64,
    log_path: parking_lot::Mutex<PathBuf>,
    /// Exclusive writer handle. Appends take this lock before reading
    /// `next_offset` and `position`, which is what serializes offset
    /// assignment across concurrent appenders.
    writer: Mutex<File>,
    index: Index,
    /// One past the last written offset, published after the index entries
    next_offset: AtomicI64,
    /// Byte length of the log file, published after the index entries
    position: AtomicU64,
    /// Wall-clock millis of the first append, 0 until a write lands
    first_write_ms: AtomicI64,
    sealed: AtomicBool,
}

impl Segment {
    /// Create a fresh, empty, writable segment.
    pub fn create(dir: &Path, base_offset: i64, max_bytes: u64) -> Result<Self> {
        Self::new(dir, base_offset, max_bytes, "", true)
    }

    /// Reopen an existing segment, recovering `next_offset` and `position`
    /// by scanning from the last intact index entry and truncating any torn
    /// trailing record.
    pub fn open(dir: &Path, base_offset: i64, max_bytes: u64) -> Result<Self> {
        Self::new(dir, base_offset, max_bytes, "", false)
    }

    /// Create a replacement segment whose files carry the truncation suffix
    /// until [`Segment::replace`] renames them over the originals.
    pub fn create_replacement(dir: &Path, base_offset: i64, max_bytes: u64) -> Result<Self> {
        Self::new(dir, base_offset, max_bytes, TRUNCATED_SUFFIX, true)
    }

    fn new(dir: &Path, base_offset: i64, max_bytes: u64, suffix: &str, create: bool) -> Result<Self> {
        let log_path = dir.join(format!("{:020}{}{}", base_offset, LOG_SUFFIX, suffix));
        let index_path = dir.join(format!("{:020}{}{}", base_offset, INDEX_SUFFIX, suffix));

        if create {
            // Truncate any leftover file so the new segment starts empty.
            File::create(&log_path)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)?;
        let log_len = file.metadata()?.len();

        let index = if create {
            Index::create(&index_path, base_offset, DEFAULT_INDEX_BYTES)?
        } else {
            Index::open(&index_path, base_offset, log_len)?
        };

        let (position, next_offset) = if create {
            (0, base_offset)
        } else {
            recover_tail(&file, &index, base_offset, log_len)?
        };

        Ok(Self {
            base_offset,
            max_bytes,
            log_path: parking_lot::Mutex::new(log_path),
            writer: Mutex::new(file),
            index,
            next_offset: AtomicI64::new(next_offset),
            position: AtomicU64::new(position),
            first_write_ms: AtomicI64::new(0),
            sealed: AtomicBool::new(false),
        })
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    /// One past the last written offset.
    pub fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    /// Current byte length of the log file.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn message_count(&self) -> i64 {
        self.next_offset() - self.base_offset
    }

    pub fn is_empty(&self) -> bool {
        self.message_count() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Timestamp of the first indexed record, 0 when empty.
    pub fn base_timestamp(&self) -> i64 {
        self.index.first_entry().map(|e| e.timestamp).unwrap_or(0)
    }

    /// Timestamp of the last indexed record, 0 when empty.
    pub fn max_timestamp(&self) -> i64 {
        self.index.last_entry().map(|e| e.timestamp).unwrap_or(0)
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_path.lock().clone()
    }

    /// Append messages, assigning offsets starting at the segment's next
    /// offset. Returns the assigned offsets.
    pub async fn append_messages(&self, messages: &[Message]) -> Result<Vec<i64>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let mut file = self.writer.lock().await;
        let base_offset = self.next_offset.load(Ordering::Acquire);
        let base_position = self.position.load(Ordering::Acquire);
        let (bytes, entries) = encode_message_set(base_offset, base_position as i64, messages);
        self.write_locked(&mut file, &bytes, &entries)
    }

    /// Append a preformed message set that already carries dense offsets
    /// starting at the segment's next offset.
    pub async fn append_message_set(&self, data: &[u8]) -> Result<Vec<i64>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut file = self.writer.lock().await;
        let base_offset = self.next_offset.load(Ordering::Acquire);
        let base_position = self.position.load(Ordering::Acquire);
        let entries = entries_for_message_set(base_offset, base_position as i64, data)?;
        self.write_locked(&mut file, data, &entries)
    }

    fn write_locked(&self, file: &mut File, bytes: &[u8], entries: &[Entry]) -> Result<Vec<i64>> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::SegmentFull);
        }
        let position = self.position.load(Ordering::Acquire);
        if position > 0 && position + bytes.len() as u64 > self.max_bytes {
            return Err(Error::SegmentFull);
        }

        file.write_all(bytes)?;
        for entry in entries {
            self.index.append(entry)?;
        }
        if let Some(last) = entries.last() {
            // Publish only after the index entries exist: a reader that
            // observes the new next_offset must be able to resolve every
            // offset below it.
            self.position
                .store(position + bytes.len() as u64, Ordering::Release);
            self.next_offset.store(last.offset + 1, Ordering::Release);
            if self.first_write_ms.load(Ordering::Relaxed) == 0 {
                self.first_write_ms
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            }
        }
        Ok(entries.iter().map(|e| e.offset).collect())
    }

    /// Forward cursor over records with `offset >= from_offset`. The index
    /// resolves the starting file position in O(log n); records are then
    /// decoded sequentially up to the published end of the segment.
    pub fn scan(self: &Arc<Self>, from_offset: i64) -> Result<SegmentScanner> {
        let position = if from_offset <= self.base_offset {
            0
        } else {
            match self.index.lookup_offset(from_offset) {
                Ok(entry) => entry.position as u64,
                Err(Error::EntryNotFound) => 0,
                Err(e) => return Err(e),
            }
        };
        Ok(SegmentScanner {
            segment: Arc::clone(self),
            position,
            from_offset,
            mmap: None,
        })
    }

    /// Earliest index entry with `timestamp >= ts`.
    pub fn find_entry_by_timestamp(&self, ts: i64) -> Result<Entry> {
        self.index.lookup_timestamp(ts)
    }

    /// Whether the segment must be rolled before accepting further appends.
    pub fn check_split(&self, roll_time: Duration) -> bool {
        // A sealed tail (left behind by truncation) takes no more writes.
        if self.is_sealed() {
            return true;
        }
        if self.position() >= self.max_bytes {
            return true;
        }
        if roll_time.is_zero() {
            return false;
        }
        let first_write = self.first_write_ms.load(Ordering::Relaxed);
        first_write != 0 && Utc::now().timestamp_millis() - first_write >= roll_time.as_millis() as i64
    }

    /// Make the segment immutable: no more appends, the index shrunk to its
    /// exact used size, both files flushed. Idempotent.
    pub async fn seal(&self) -> Result<()> {
        let file = self.writer.lock().await;
        if self.sealed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.index.seal()?;
        file.sync_all()?;
        Ok(())
    }

    /// Atomically rename this segment's files over `other`'s, adopting its
    /// paths. The descriptors and mappings survive the rename.
    pub async fn replace(&self, other: &Segment) -> Result<()> {
        let file = self.writer.lock().await;
        file.sync_all()?;
        self.index.sync()?;

        let target_log = other.log_path();
        let target_index = other.index.path();
        {
            let mut log_path = self.log_path.lock();
            std::fs::rename(&*log_path, &target_log)?;
            *log_path = target_log;
        }
        self.index.rename_over(&target_index)?;
        Ok(())
    }

    /// Unlink both files. The segment must not be written afterwards; open
    /// scanners keep reading the unlinked data until they are dropped.
    pub fn delete(&self) -> Result<()> {
        let log_path = self.log_path.lock().clone();
        if log_path.exists() {
            std::fs::remove_file(&log_path)?;
        }
        self.index.delete()?;
        Ok(())
    }

    /// Fsync the log file and flush the index mapping.
    pub async fn flush(&self) -> Result<()> {
        let file = self.writer.lock().await;
        file.sync_all()?;
        self.index.sync()?;
        Ok(())
    }
}

/// Scan the log from the last intact index entry to EOF, rebuilding missing
/// index entries and cutting a torn trailing record back to the last record
/// boundary. Returns the recovered `(position, next_offset)`.
fn recover_tail(file: &File, index: &Index, base_offset: i64, log_len: u64) -> Result<(u64, i64)> {
    let (mut pos, mut expected) = match index.last_entry() {
        Some(entry) => (entry.position as u64, entry.offset),
        None => (0, base_offset),
    };
    if log_len == 0 {
        return Ok((0, base_offset));
    }

    // SAFETY: read-only mapping of a file this process owns exclusively;
    // every access below is bounds-checked against the mapped length.
    let mmap = unsafe { Mmap::map(file)? };
    let len = (log_len as usize).min(mmap.len());

    while (pos as usize) < len {
        match decode_message(&mmap[pos as usize..len]) {
            Ok((offset, message, consumed)) if offset == expected => {
                if index.last_entry().map_or(true, |e| e.offset < offset) {
                    index.append(&Entry {
                        offset,
                        position: pos as i64,
                        timestamp: message.timestamp,
                    })?;
                }
                pos += consumed as u64;
                expected += 1;
            }
            _ => {
                warn!(
                    base_offset,
                    position = pos,
                    "discarding torn record tail during segment recovery"
                );
                file.set_len(pos)?;
                break;
            }
        }
    }

    index.truncate_entries_after(expected - 1);
    Ok((pos, expected))
}

/// Cursor over a segment's records. Valid until the segment is deleted; a
/// scanner that outlives a deletion keeps reading the unlinked file.
#[derive(Debug)]
pub struct SegmentScanner {
    segment: Arc<Segment>,
    position: u64,
    from_offset: i64,
    mmap: Option<Mmap>,
}

impl SegmentScanner {
    /// Decode the next record at or past the scanner's starting offset.
    /// Returns `None` at the published end of the segment.
    pub fn next(&mut self) -> Result<Option<(i64, Message)>> {
        loop {
            let published = self.segment.position();
            if self.position >= published {
                return Ok(None);
            }
            let stale = match &self.mmap {
                Some(mmap) => (mmap.len() as u64) < published,
                None => true,
            };
            if stale {
                let file = File::open(self.segment.log_path())?;
                // SAFETY: read-only mapping, bounds-checked below.
                self.mmap = Some(unsafe { Mmap::map(&file)? });
            }
            let mmap = match self.mmap.as_ref() {
                Some(mmap) => mmap,
                None => return Ok(None),
            };
            let end = (published as usize).min(mmap.len());
            if self.position as usize >= end {
                return Ok(None);
            }

            let (offset, message, consumed) = decode_message(&mmap[self.position as usize..end])?;
            self.position += consumed as u64;
            if offset < self.from_offset {
                continue;
            }
            return Ok(Some((offset, message)));
        }
    }
}
