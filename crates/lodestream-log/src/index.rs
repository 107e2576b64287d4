//! Memory-mapped offset index backing a segment.
//!
//! Each entry is 16 bytes, big-endian: a `u32` offset delta relative to the
//! segment's base offset, a `u32` log file position, and an `i64` millisecond
//! timestamp. Entries are written in append order, so offsets and positions
//! are strictly increasing and lookups binary search the mapping directly.

use memmap2::MmapMut;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// On-disk width of one entry
pub const ENTRY_WIDTH: usize = 16;

/// Preallocated index size, rounded down to the entry width
pub(crate) const DEFAULT_INDEX_BYTES: u64 = 10 * 1024 * 1024;

/// One index record: the log file position where the message with this
/// offset begins, plus its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub offset: i64,
    pub position: i64,
    pub timestamp: i64,
}

#[derive(Debug)]
pub struct Index {
    base_offset: i64,
    inner: Mutex<IndexInner>,
}

#[derive(Debug)]
struct IndexInner {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    used: usize,
}

impl Index {
    /// Create a fresh index file, preallocated to `capacity_bytes`.
    pub fn create(path: impl Into<PathBuf>, base_offset: i64, capacity_bytes: u64) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let capacity = round_to_entry(capacity_bytes);
        file.set_len(capacity)?;
        // SAFETY: the file is exclusively owned by this index for the life of
        // the mapping and was just sized to a nonzero length.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            base_offset,
            inner: Mutex::new(IndexInner {
                path,
                file,
                mmap,
                used: 0,
            }),
        })
    }

    /// Open an existing index file, validating its tail against the log
    /// file's current length. Entries past the first hole or non-monotonic
    /// slot are discarded; the segment's recovery scan rebuilds them.
    pub fn open(path: impl Into<PathBuf>, base_offset: i64, log_len: u64) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() < ENTRY_WIDTH as u64 {
            file.set_len(round_to_entry(DEFAULT_INDEX_BYTES))?;
        }
        // SAFETY: same exclusivity argument as `create`; length is nonzero.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let mut used = 0;
        let mut prev_delta = 0u32;
        let mut prev_position = 0u32;
        for slot in 0..mmap.len() / ENTRY_WIDTH {
            let (delta, position, timestamp) = read_slot(&mmap, slot);
            let valid = if slot == 0 {
                // The first record of a segment always sits at position 0
                // with delta 0. A zero timestamp marks an unwritten slot.
                delta == 0 && position == 0 && timestamp != 0 && log_len > 0
            } else {
                delta > prev_delta && position > prev_position && (position as u64) < log_len
            };
            if !valid {
                break;
            }
            used += ENTRY_WIDTH;
            prev_delta = delta;
            prev_position = position;
        }

        Ok(Self {
            base_offset,
            inner: Mutex::new(IndexInner {
                path,
                file,
                mmap,
                used,
            }),
        })
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().used / ENTRY_WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Append an entry at the current slot, extending the mapping if the
    /// preallocated capacity is exhausted.
    pub fn append(&self, entry: &Entry) -> Result<()> {
        let delta = u32::try_from(entry.offset - self.base_offset)
            .map_err(|_| Error::CorruptFormat("index offset delta overflows u32".to_string()))?;
        let position = u32::try_from(entry.position)
            .map_err(|_| Error::CorruptFormat("index position overflows u32".to_string()))?;

        let mut inner = self.inner.lock();
        if inner.used + ENTRY_WIDTH > inner.mmap.len() {
            inner.grow()?;
        }
        let at = inner.used;
        inner.mmap[at..at + 4].copy_from_slice(&delta.to_be_bytes());
        inner.mmap[at + 4..at + 8].copy_from_slice(&position.to_be_bytes());
        inner.mmap[at + 8..at + 16].copy_from_slice(&entry.timestamp.to_be_bytes());
        inner.used += ENTRY_WIDTH;
        Ok(())
    }

    /// Find the greatest entry with `offset <= target`.
    pub fn lookup_offset(&self, target: i64) -> Result<Entry> {
        let inner = self.inner.lock();
        let count = inner.used / ENTRY_WIDTH;
        if count == 0 || target < self.base_offset {
            return Err(Error::EntryNotFound);
        }
        let idx = partition_slots(count, |slot| {
            let (delta, _, _) = read_slot(&inner.mmap, slot);
            self.base_offset + delta as i64 <= target
        });
        // The first entry holds the base offset, so idx >= 1 here.
        Ok(self.entry_at(&inner, idx - 1))
    }

    /// Find the earliest entry with `timestamp >= target`.
    pub fn lookup_timestamp(&self, target: i64) -> Result<Entry> {
        let inner = self.inner.lock();
        let count = inner.used / ENTRY_WIDTH;
        let idx = partition_slots(count, |slot| {
            let (_, _, timestamp) = read_slot(&inner.mmap, slot);
            timestamp < target
        });
        if idx == count {
            return Err(Error::EntryNotFound);
        }
        Ok(self.entry_at(&inner, idx))
    }

    pub fn first_entry(&self) -> Option<Entry> {
        let inner = self.inner.lock();
        if inner.used == 0 {
            return None;
        }
        Some(self.entry_at(&inner, 0))
    }

    pub fn last_entry(&self) -> Option<Entry> {
        let inner = self.inner.lock();
        let count = inner.used / ENTRY_WIDTH;
        if count == 0 {
            return None;
        }
        Some(self.entry_at(&inner, count - 1))
    }

    /// Discard every entry with an offset greater than `offset`. The dropped
    /// region is zeroed so a later open does not mistake it for live data.
    pub fn truncate_entries_after(&self, offset: i64) {
        let mut inner = self.inner.lock();
        let count = inner.used / ENTRY_WIDTH;
        let keep = partition_slots(count, |slot| {
            let (delta, _, _) = read_slot(&inner.mmap, slot);
            self.base_offset + delta as i64 <= offset
        });
        let from = keep * ENTRY_WIDTH;
        let to = inner.used;
        inner.mmap[from..to].fill(0);
        inner.used = from;
    }

    /// Shrink the file to its exact used size and flush it. Called when the
    /// owning segment is sealed.
    pub fn seal(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.mmap.flush()?;
        let used = inner.used as u64;
        if inner.file.metadata()?.len() == used {
            return Ok(());
        }
        inner.file.set_len(used)?;
        if used > 0 {
            // SAFETY: remapping the same exclusively-owned file at its new length.
            let remapped = unsafe { MmapMut::map_mut(&inner.file)? };
            inner.mmap = remapped;
        }
        inner.file.sync_all()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.mmap.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Rename the backing file over `target`, adopting the new path. The
    /// mapping and descriptor survive the rename.
    pub fn rename_over(&self, target: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        std::fs::rename(&inner.path, target)?;
        inner.path = target.to_path_buf();
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        let inner = self.inner.lock();
        if inner.path.exists() {
            std::fs::remove_file(&inner.path)?;
        }
        Ok(())
    }

    fn entry_at(&self, inner: &IndexInner, slot: usize) -> Entry {
        let (delta, position, timestamp) = read_slot(&inner.mmap, slot);
        Entry {
            offset: self.base_offset + delta as i64,
            position: position as i64,
            timestamp,
        }
    }
}

impl IndexInner {
    fn grow(&mut self) -> Result<()> {
        self.mmap.flush()?;
        let new_len = (self.mmap.len() as u64 * 2).max(ENTRY_WIDTH as u64);
        self.file.set_len(new_len)?;
        // SAFETY: remapping the same exclusively-owned file after growth.
        let remapped = unsafe { MmapMut::map_mut(&self.file)? };
        self.mmap = remapped;
        Ok(())
    }
}

fn read_slot(mmap: &[u8], slot: usize) -> (u32, u32, i64) {
    let at = slot * ENTRY_WIDTH;
    let delta = u32::from_be_bytes(mmap[at..at + 4].try_into().unwrap());
    let position = u32::from_be_bytes(mmap[at + 4..at + 8].try_into().unwrap());
    let timestamp = i64::from_be_bytes(mmap[at + 8..at + 16].try_into().unwrap());
    (delta, position, timestamp)
}

/// Index analogue of `slice::partition_point` over entry slots.
fn partition_slots(count: usize, pred: impl Fn(usize) -> bool) -> usize {
    let mut lo = 0;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

fn round_to_entry(bytes: u64) -> u64 {
    let rounded = bytes - (bytes % ENTRY_WIDTH as u64);
    rounded.max(ENTRY_WIDTH as u64)
}
