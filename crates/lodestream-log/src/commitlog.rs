//! The commit log: a durable, append-only, offset-indexed message sequence
//! partitioned into segments.
//!
//! Appends go to the active (trailing) segment, discovered through a
//! lock-free pointer so the hot path never touches the segment-list lock.
//! When the active segment fills (or ages past the roll time) it is sealed
//! and a successor is swapped in with a compare-and-swap; the loser of a
//! racing swap deletes its speculative segment and retries. Two background
//! tasks checkpoint the high watermark and enforce retention until the log
//! is closed.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cleaner::{Cleaner, RetentionPolicy};
use crate::config::LogConfig;
use crate::message::Message;
use crate::reader::LogReader;
use crate::segment::{Segment, INDEX_SUFFIX, LOG_SUFFIX, TRUNCATED_SUFFIX};
use crate::{Error, Result};

/// Checkpoint file holding the high watermark as ASCII decimal
const HW_CHECKPOINT_NAME: &str = "replication-offset-checkpoint";
const HW_TMP_NAME: &str = "replication-offset-checkpoint.tmp";

struct HwState {
    hw: i64,
    waiters: HashMap<u64, oneshot::Sender<()>>,
}

/// A durable, segmented commit log rooted in a single directory.
pub struct CommitLog {
    config: LogConfig,
    path: PathBuf,
    name: String,
    cleaner: Cleaner,
    /// Lock-free pointer to the trailing segment, the only append target.
    /// The CAS during a roll is the single linearization point of rotation.
    active: ArcSwap<Segment>,
    /// Offset-sorted, never empty; the last element is the active segment.
    segments: RwLock<Vec<Arc<Segment>>>,
    /// High watermark plus pending waiter signals, under one lock so an
    /// advance and a waiter registration cannot interleave to lose a wakeup.
    hw: parking_lot::Mutex<HwState>,
    /// Serializes successor-segment creation during a roll: two speculative
    /// segments would share one path on disk. The pointer CAS below remains
    /// the commit point of the rotation.
    rolling: tokio::sync::Mutex<()>,
    /// Serializes checkpoint writes: the close path and the background loop
    /// share one temp file.
    checkpointing: parking_lot::Mutex<()>,
    closed: AtomicBool,
    shutdown: Notify,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    next_reader_id: AtomicU64,
}

impl CommitLog {
    /// Open (or create) the log in `config.path`, recover its segments and
    /// high watermark, and start the checkpoint and retention loops.
    pub async fn open(config: LogConfig) -> Result<Arc<Self>> {
        let config = config.normalized()?;
        std::fs::create_dir_all(&config.path)?;
        let path = config.path.clone();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        // Stray files from interrupted truncations or checkpoints are dead.
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            let Some(file_name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if file_name.ends_with(TRUNCATED_SUFFIX) || file_name == HW_TMP_NAME {
                warn!(log = %name, file = %file_name, "removing stray file from an interrupted operation");
                std::fs::remove_file(entry.path())?;
            }
        }

        let mut hw = -1i64;
        let mut bases = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            let Some(file_name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if file_name == HW_CHECKPOINT_NAME {
                let raw = std::fs::read_to_string(entry.path())?;
                hw = raw.trim().parse::<i64>().map_err(|_| {
                    Error::CorruptFormat(format!("invalid high watermark checkpoint {:?}", raw))
                })?;
            } else if let Some(stem) = file_name.strip_suffix(INDEX_SUFFIX) {
                // An index without its log is an orphan from a partial delete.
                if !path.join(format!("{}{}", stem, LOG_SUFFIX)).exists() {
                    warn!(log = %name, file = %file_name, "removing orphaned index file");
                    std::fs::remove_file(entry.path())?;
                }
            } else if let Some(stem) = file_name.strip_suffix(LOG_SUFFIX) {
                let base = stem.parse::<i64>().map_err(|_| {
                    Error::CorruptFormat(format!("unparseable segment file name {:?}", file_name))
                })?;
                bases.push(base);
            }
        }
        bases.sort_unstable();

        let mut segments = Vec::with_capacity(bases.len().max(1));
        for base in bases {
            segments.push(Arc::new(Segment::open(
                &path,
                base,
                config.max_segment_bytes,
            )?));
        }
        if segments.is_empty() {
            segments.push(Arc::new(Segment::create(
                &path,
                0,
                config.max_segment_bytes,
            )?));
        }
        let active = segments[segments.len() - 1].clone();

        info!(log = %name, segments = segments.len(), hw, "opened commit log");

        let cleaner = Cleaner::new(
            name.clone(),
            RetentionPolicy {
                max_bytes: config.max_log_bytes,
                max_messages: config.max_log_messages,
                max_age: config.max_log_age,
            },
        );

        let log = Arc::new(Self {
            config,
            path,
            name,
            cleaner,
            active: ArcSwap::from(active),
            segments: RwLock::new(segments),
            hw: parking_lot::Mutex::new(HwState {
                hw,
                waiters: HashMap::new(),
            }),
            rolling: tokio::sync::Mutex::new(()),
            checkpointing: parking_lot::Mutex::new(()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            next_reader_id: AtomicU64::new(0),
        });

        let checkpoint_log = log.clone();
        let checkpoint_task = tokio::spawn(async move { checkpoint_log.checkpoint_hw_loop().await });
        let cleaner_log = log.clone();
        let cleaner_task = tokio::spawn(async move { cleaner_log.cleaner_loop().await });
        log.tasks.lock().extend([checkpoint_task, cleaner_task]);

        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the last message in the log, -1 when empty.
    pub fn newest_offset(&self) -> i64 {
        self.active.load().next_offset() - 1
    }

    /// Offset of the first retained message.
    pub async fn oldest_offset(&self) -> i64 {
        self.segments.read().await[0].base_offset()
    }

    /// Snapshot of the current segment list.
    pub async fn segments(&self) -> Vec<Arc<Segment>> {
        self.segments.read().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Append a batch of messages, returning their assigned offsets.
    pub async fn append(&self, messages: &[Message]) -> Result<Vec<i64>> {
        self.ensure_open()?;
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        loop {
            self.check_and_perform_split().await?;
            let segment = self.active.load_full();
            match segment.append_messages(messages).await {
                // The segment filled (or sealed) under us; roll and retry.
                Err(Error::SegmentFull) => continue,
                other => return other,
            }
        }
    }

    /// Append a preformed message set (the replication path), returning the
    /// offsets it occupies.
    pub async fn append_message_set(&self, data: &[u8]) -> Result<Vec<i64>> {
        self.ensure_open()?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        loop {
            self.check_and_perform_split().await?;
            let segment = self.active.load_full();
            match segment.append_message_set(data).await {
                Err(Error::SegmentFull) => continue,
                other => return other,
            }
        }
    }

    /// Earliest offset whose timestamp is at or past `timestamp`; one past
    /// the newest offset when the timestamp is beyond the end of the log.
    pub async fn offset_for_timestamp(&self, timestamp: i64) -> Result<i64> {
        let segments = self.segments.read().await;

        // First segment whose base timestamp is past the target, then search
        // its predecessor; an empty result falls forward to that segment.
        let idx = segments.partition_point(|s| s.base_timestamp() <= timestamp);
        let segment = if idx == 0 {
            &segments[0]
        } else {
            &segments[idx - 1]
        };
        match segment.find_entry_by_timestamp(timestamp) {
            Ok(entry) => return Ok(entry.offset),
            Err(Error::EntryNotFound) => {}
            Err(e) => return Err(e),
        }
        if idx < segments.len() {
            let entry = segments[idx].find_entry_by_timestamp(timestamp)?;
            return Ok(entry.offset);
        }
        Ok(segments[segments.len() - 1].next_offset())
    }

    /// Current high watermark, -1 before any advance.
    pub fn high_watermark(&self) -> i64 {
        self.hw.lock().hw
    }

    /// Advance the high watermark. Every message up to and including `hw`
    /// is considered committed. Regressions are ignored; an advance wakes
    /// and clears all pending waiters.
    pub fn set_high_watermark(&self, hw: i64) {
        let mut state = self.hw.lock();
        if hw > state.hw {
            state.hw = hw;
            for (_, waiter) in state.waiters.drain() {
                let _ = waiter.send(());
            }
        }
    }

    /// Signal that fires once the high watermark moves away from
    /// `observed_hw`. If it already has, the signal is pre-fired. One
    /// registration per reader id; a newer wait replaces an older one.
    pub fn wait_for_hw_change(&self, reader_id: u64, observed_hw: i64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.hw.lock();
        if state.hw != observed_hw {
            let _ = tx.send(());
        } else {
            state.waiters.insert(reader_id, tx);
        }
        rx
    }

    /// Drop a reader's pending waiter registration, firing its signal.
    pub fn remove_hw_waiter(&self, reader_id: u64) {
        self.hw.lock().waiters.remove(&reader_id);
    }

    /// Committed-offset reader starting at `start_offset`.
    pub fn reader(self: &Arc<Self>, start_offset: i64) -> LogReader {
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        LogReader::new(self.clone(), id, start_offset)
    }

    /// Remove every message at or past `offset`, reconciling the log to a
    /// replica-agreed prefix. A no-op when `offset` is past the newest
    /// offset.
    pub async fn truncate(&self, offset: i64) -> Result<()> {
        self.ensure_open()?;
        // Hold the roll guard so no split can swap the active pointer while
        // the segment list is being rebuilt.
        let _roll = self.rolling.lock().await;
        let mut segments = self.segments.write().await;
        let Some(idx) = segments
            .iter()
            .position(|s| offset >= s.base_offset() && offset < s.next_offset())
        else {
            return Ok(());
        };
        let segment = segments[idx].clone();
        info!(log = %self.name, offset, "truncating log");

        // Everything after the containing segment goes outright.
        for s in segments.iter().skip(idx + 1) {
            s.delete()?;
        }
        segments.truncate(idx + 1);

        if segment.base_offset() == offset && idx > 0 {
            // The whole segment is being truncated away.
            segment.delete()?;
            segments.truncate(idx);
        } else {
            // Rebuild the containing segment from its retained prefix, then
            // atomically swap the rebuilt files over the originals.
            let replacement = Arc::new(Segment::create_replacement(
                &self.path,
                segment.base_offset(),
                self.config.max_segment_bytes,
            )?);
            let mut scanner = segment.scan(segment.base_offset())?;
            let mut retained = Vec::new();
            while let Some((msg_offset, message)) = scanner.next()? {
                if msg_offset >= offset {
                    break;
                }
                retained.push(message);
            }
            if !retained.is_empty() {
                replacement.append_messages(&retained).await?;
            }
            replacement.replace(&segment).await?;
            segments[idx] = replacement;
        }

        let active = segments[segments.len() - 1].clone();
        self.active.store(active);
        Ok(())
    }

    /// Flush the high watermark and every segment, stop the background
    /// loops, and join them. Further operations fail with [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        self.checkpoint_hw()?;
        self.shutdown.notify_waiters();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let segments = self.segments.read().await;
        for segment in segments.iter() {
            segment.flush().await?;
        }
        info!(log = %self.name, "closed commit log");
        Ok(())
    }

    /// Close the log and remove its directory from the filesystem.
    pub async fn delete(&self) -> Result<()> {
        self.close().await?;
        std::fs::remove_dir_all(&self.path)?;
        Ok(())
    }

    pub(crate) fn shutdown_notify(&self) -> &Notify {
        &self.shutdown
    }

    /// Segment containing `offset`, if retained.
    pub(crate) async fn find_segment(&self, offset: i64) -> Option<Arc<Segment>> {
        let segments = self.segments.read().await;
        segments
            .iter()
            .find(|s| offset >= s.base_offset() && offset < s.next_offset())
            .cloned()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Roll the active segment for as long as it needs rolling. Returns
    /// whether any split happened. Racing appenders cooperate: whoever wins
    /// the pointer CAS installs the new segment, everyone else retries
    /// against the fresh active.
    async fn check_and_perform_split(&self) -> Result<bool> {
        let mut split = false;
        loop {
            let active = self.active.load_full();
            if !active.check_split(self.config.log_roll_time) {
                return Ok(split);
            }
            split = true;
            match self.split(&active).await {
                Ok(()) => {}
                Err(Error::SegmentExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn split(&self, old_active: &Arc<Segment>) -> Result<()> {
        let _roll = self.rolling.lock().await;
        // Re-check under the roll guard: a racing appender may have already
        // installed a successor while we waited.
        {
            let current = self.active.load();
            if !Arc::ptr_eq(&current, old_active) {
                return Err(Error::SegmentExists(current.base_offset()));
            }
        }

        // Seal first so no append can advance next_offset once the
        // successor's base is chosen. Seal is idempotent, so sealing a
        // segment that truncation already sealed is harmless.
        old_active.seal().await?;
        let base_offset = old_active.next_offset();
        debug!(log = %self.name, base_offset, "rolling new log segment");

        let segment = Arc::new(Segment::create(
            &self.path,
            base_offset,
            self.config.max_segment_bytes,
        )?);
        let previous = self.active.compare_and_swap(old_active, segment.clone());
        if !Arc::ptr_eq(&previous, old_active) {
            // Another appender already installed a successor.
            segment.delete()?;
            return Err(Error::SegmentExists(base_offset));
        }

        let mut segments = self.segments.write().await;
        segments.push(segment);
        // Rolling is the natural moment to enforce retention: the list just
        // grew and the old active is now deletable once its successors age.
        self.cleaner.clean(&mut segments)?;
        Ok(())
    }

    async fn checkpoint_hw_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.hw_checkpoint_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        loop {
            if self.is_closed() {
                return;
            }
            tokio::select! {
                _ = &mut shutdown => return,
                _ = ticker.tick() => {}
            }
            if self.is_closed() {
                return;
            }
            if let Err(e) = self.checkpoint_hw() {
                error!(log = %self.name, error = %e, "failed to checkpoint high watermark");
                // A filesystem that cannot take the checkpoint cannot keep
                // the log's durability promises.
                panic!("failed to checkpoint high watermark: {}", e);
            }
        }
    }

    async fn cleaner_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.cleaner_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        loop {
            if self.is_closed() {
                return;
            }
            tokio::select! {
                _ = &mut shutdown => return,
                _ = ticker.tick() => {}
            }
            if self.is_closed() {
                return;
            }

            // A split runs the cleaner itself, so only clean directly when
            // no split happened.
            match self.check_and_perform_split().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(log = %self.name, error = %e, "failed to split log segment");
                    continue;
                }
            }
            let mut segments = self.segments.write().await;
            if let Err(e) = self.cleaner.clean(&mut segments) {
                warn!(log = %self.name, error = %e, "retention pass failed");
            }
        }
    }

    /// Write the high watermark to the checkpoint file via a temp file and
    /// an atomic rename, fsyncing before the swap.
    fn checkpoint_hw(&self) -> Result<()> {
        let _guard = self.checkpointing.lock();
        let hw = self.high_watermark();
        let tmp = self.path.join(HW_TMP_NAME);
        let target = self.path.join(HW_CHECKPOINT_NAME);
        std::fs::write(&tmp, hw.to_string().as_bytes())?;
        let file = std::fs::File::open(&tmp)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }
}

impl std::fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLog")
            .field("path", &self.path)
            .field("newest_offset", &self.newest_offset())
            .field("hw", &self.high_watermark())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn msg(value: &str) -> Message {
        Message::new(value.to_string())
    }

    #[tokio::test]
    async fn test_append_returns_contiguous_offsets() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path())).await.unwrap();

        let offsets = log.append(&[msg("a"), msg("b"), msg("c")]).await.unwrap();
        assert_eq!(offsets, vec![0, 1, 2]);

        let offsets = log.append(&[msg("d")]).await.unwrap();
        assert_eq!(offsets, vec![3]);
        assert_eq!(log.newest_offset(), 3);
        assert_eq!(log.oldest_offset().await, 0);

        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_rotates_segments() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path()).with_max_segment_bytes(256))
            .await
            .unwrap();

        for i in 0..32 {
            log.append(&[msg(&format!("message-{:04}", i))]).await.unwrap();
        }
        assert_eq!(log.newest_offset(), 31);

        let segments = log.segments().await;
        assert!(segments.len() > 1, "expected a roll, got one segment");
        for pair in segments.windows(2) {
            assert_eq!(pair[0].next_offset(), pair[1].base_offset());
            assert!(pair[0].is_sealed());
        }

        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_appends_form_contiguous_range() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path()).with_max_segment_bytes(20 * 1024))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for writer in 0..5 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let mut offsets = Vec::new();
                for i in 0..20 {
                    let value = format!("writer-{}-{:03}-{}", writer, i, "x".repeat(500));
                    offsets.extend(log.append(&[Message::new(value)]).await.unwrap());
                }
                offsets
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        let expected: Vec<i64> = (0..100).collect();
        assert_eq!(all, expected, "offsets must form a dense range");

        let segments = log.segments().await;
        assert!(segments.len() > 1);
        let mut bases: Vec<i64> = segments.iter().map(|s| s.base_offset()).collect();
        let before = bases.len();
        bases.dedup();
        assert_eq!(bases.len(), before, "duplicate base offsets");

        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_preserves_messages() {
        let dir = TempDir::new().unwrap();
        {
            let log = CommitLog::open(LogConfig::new(dir.path()).with_max_segment_bytes(512))
                .await
                .unwrap();
            for i in 0..10 {
                log.append(&[msg(&format!("persisted-{}", i))]).await.unwrap();
            }
            log.set_high_watermark(9);
            log.close().await.unwrap();
        }

        let log = CommitLog::open(LogConfig::new(dir.path())).await.unwrap();
        assert_eq!(log.newest_offset(), 9);
        assert_eq!(log.high_watermark(), 9);

        let mut reader = log.reader(0);
        for i in 0..10 {
            let message = reader.next().await.unwrap();
            assert_eq!(message.value, Bytes::from(format!("persisted-{}", i)));
        }
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_torn_write_recovery() {
        let dir = TempDir::new().unwrap();
        {
            let log = CommitLog::open(LogConfig::new(dir.path())).await.unwrap();
            log.append(&[msg("intact"), msg("torn")]).await.unwrap();
            log.close().await.unwrap();
        }

        // Cut the last three bytes, tearing the final record.
        let log_file = dir.path().join(format!("{:020}.log", 0));
        let len = std::fs::metadata(&log_file).unwrap().len();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&log_file)
            .unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let log = CommitLog::open(LogConfig::new(dir.path())).await.unwrap();
        assert_eq!(log.newest_offset(), 0);

        let offsets = log.append(&[msg("after-recovery")]).await.unwrap();
        assert_eq!(offsets, vec![1]);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_orphaned_index_is_removed_on_open() {
        let dir = TempDir::new().unwrap();
        let orphan = dir.path().join(format!("{:020}.index", 77));
        std::fs::write(&orphan, vec![0u8; 64]).unwrap();
        let stray = dir.path().join(format!("{:020}.log{}", 9, TRUNCATED_SUFFIX));
        std::fs::write(&stray, b"leftover").unwrap();

        let log = CommitLog::open(LogConfig::new(dir.path())).await.unwrap();
        assert!(!orphan.exists());
        assert!(!stray.exists());
        assert_eq!(log.newest_offset(), -1);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_truncate_to_mid_segment_offset() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path()).with_max_segment_bytes(2048))
            .await
            .unwrap();

        for i in 0..1000 {
            log.append(&[msg(&format!("m{}", i))]).await.unwrap();
        }
        assert_eq!(log.newest_offset(), 999);

        log.truncate(300).await.unwrap();
        assert_eq!(log.newest_offset(), 299);

        log.set_high_watermark(299);
        let mut reader = log.reader(0);
        for i in 0..300 {
            let message = reader.next().await.unwrap();
            assert_eq!(message.value, Bytes::from(format!("m{}", i)));
        }

        // Appends continue from the truncation point.
        let offsets = log.append(&[msg("tail")]).await.unwrap();
        assert_eq!(offsets, vec![300]);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_truncate_on_segment_boundary_drops_segment() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path()).with_max_segment_bytes(256))
            .await
            .unwrap();

        for i in 0..32 {
            log.append(&[msg(&format!("boundary-{:04}", i))]).await.unwrap();
        }
        let segments = log.segments().await;
        assert!(segments.len() >= 3);
        let boundary = segments[2].base_offset();

        log.truncate(boundary).await.unwrap();
        assert_eq!(log.newest_offset(), boundary - 1);
        let segments = log.segments().await;
        assert_eq!(segments[segments.len() - 1].next_offset(), boundary);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_truncate_past_end_is_noop() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path())).await.unwrap();
        log.append(&[msg("a"), msg("b")]).await.unwrap();

        log.truncate(log.newest_offset() + 1).await.unwrap();
        assert_eq!(log.newest_offset(), 1);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_truncate_to_zero_empties_log() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path())).await.unwrap();
        log.append(&[msg("a"), msg("b")]).await.unwrap();

        log.truncate(0).await.unwrap();
        assert_eq!(log.newest_offset(), -1);
        assert_eq!(log.oldest_offset().await, 0);

        let offsets = log.append(&[msg("fresh")]).await.unwrap();
        assert_eq!(offsets, vec![0]);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_retention_by_bytes_trims_old_segments() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(
            LogConfig::new(dir.path())
                .with_max_segment_bytes(4 * 1024)
                .with_max_log_bytes(16 * 1024),
        )
        .await
        .unwrap();

        // Write well past the retention limit; the cleaner runs on every
        // roll, so by the end only segments within the budget remain.
        let payload = "p".repeat(450);
        for i in 0..100 {
            log.append(&[Message::new(format!("{}-{}", i, payload))])
                .await
                .unwrap();
        }

        let segments = log.segments().await;
        let total: u64 = segments.iter().map(|s| s.position()).sum();
        assert!(
            total <= 16 * 1024 + 4 * 1024,
            "retained {} bytes across {} segments",
            total,
            segments.len()
        );
        assert!(log.oldest_offset().await > 0, "oldest segments were deleted");
        assert_eq!(log.newest_offset(), 99, "retention must not touch the tail");
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offset_for_timestamp() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path())).await.unwrap();
        log.append(&[
            msg("a").with_timestamp(100),
            msg("b").with_timestamp(200),
            msg("c").with_timestamp(200),
            msg("d").with_timestamp(400),
        ])
        .await
        .unwrap();

        assert_eq!(log.offset_for_timestamp(200).await.unwrap(), 1);
        assert_eq!(log.offset_for_timestamp(300).await.unwrap(), 3);
        assert_eq!(log.offset_for_timestamp(500).await.unwrap(), 4);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offset_for_timestamp_across_segments() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path()).with_max_segment_bytes(64))
            .await
            .unwrap();

        for (i, ts) in [100i64, 200, 300, 400].iter().enumerate() {
            log.append(&[msg(&format!("spread-{}", i)).with_timestamp(*ts)])
                .await
                .unwrap();
        }
        assert!(log.segments().await.len() > 1);

        assert_eq!(log.offset_for_timestamp(250).await.unwrap(), 2);
        assert_eq!(log.offset_for_timestamp(100).await.unwrap(), 0);
        assert_eq!(log.offset_for_timestamp(999).await.unwrap(), 4);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_high_watermark_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path())).await.unwrap();
        assert_eq!(log.high_watermark(), -1);

        log.set_high_watermark(5);
        log.set_high_watermark(3);
        assert_eq!(log.high_watermark(), 5);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_hw_checkpoint_written_on_close() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path())).await.unwrap();
        log.append(&[msg("a")]).await.unwrap();
        log.set_high_watermark(0);
        log.close().await.unwrap();

        let checkpoint = dir.path().join(HW_CHECKPOINT_NAME);
        let raw = std::fs::read_to_string(&checkpoint).unwrap();
        assert_eq!(raw.trim().parse::<i64>().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path())).await.unwrap();
        log.close().await.unwrap();

        assert!(matches!(log.append(&[msg("x")]).await, Err(Error::Closed)));
        assert!(matches!(log.truncate(0).await, Err(Error::Closed)));
        assert!(matches!(log.close().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_delete_removes_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doomed");
        let log = CommitLog::open(LogConfig::new(&path)).await.unwrap();
        log.append(&[msg("x")]).await.unwrap();

        log.delete().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_append_message_set_round_trip() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(LogConfig::new(dir.path())).await.unwrap();
        log.append(&[msg("lead")]).await.unwrap();

        let batch = [
            msg("replicated-1").with_timestamp(10),
            msg("replicated-2").with_timestamp(20),
        ];
        let (bytes, _) = crate::message::encode_message_set(1, 0, &batch);
        let offsets = log.append_message_set(&bytes).await.unwrap();
        assert_eq!(offsets, vec![1, 2]);
        assert_eq!(log.newest_offset(), 2);

        log.set_high_watermark(2);
        let mut reader = log.reader(1);
        assert_eq!(reader.next().await.unwrap().value, Bytes::from("replicated-1"));
        assert_eq!(reader.next().await.unwrap().value, Bytes::from("replicated-2"));
        log.close().await.unwrap();
    }
}
