//! Committed-offset reader.
//!
//! A reader streams messages in offset order, resolving segments through the
//! commit log as it advances. At the committed edge it parks on the log's
//! high watermark signal, racing it against the log's shutdown notification
//! so a close does not leave the reader parked forever.

use std::sync::Arc;

use crate::commitlog::CommitLog;
use crate::message::Message;
use crate::segment::SegmentScanner;
use crate::{Error, Result};

/// Streams committed messages from a [`CommitLog`] starting at a fixed
/// offset. Created with [`CommitLog::reader`].
#[derive(Debug)]
pub struct LogReader {
    log: Arc<CommitLog>,
    id: u64,
    next_offset: i64,
    scanner: Option<SegmentScanner>,
}

impl LogReader {
    pub(crate) fn new(log: Arc<CommitLog>, id: u64, start_offset: i64) -> Self {
        Self {
            log,
            id,
            next_offset: start_offset.max(0),
            scanner: None,
        }
    }

    /// Offset the next call to [`next`](Self::next) will yield.
    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    /// Yield the next committed message, blocking while the read position
    /// sits past the high watermark. Fails with [`Error::SegmentNotFound`]
    /// when the position has fallen below the retained range, and with
    /// [`Error::Closed`] once the log shuts down.
    pub async fn next(&mut self) -> Result<Message> {
        loop {
            if self.log.is_closed() {
                return Err(Error::Closed);
            }
            let hw = self.log.high_watermark();
            if self.next_offset > hw {
                self.wait_for_commit(hw).await?;
                continue;
            }

            if let Some(scanner) = self.scanner.as_mut() {
                if let Some((offset, message)) = scanner.next()? {
                    self.next_offset = offset + 1;
                    return Ok(message);
                }
                // Exhausted the current segment; resolve the next one.
                self.scanner = None;
            }

            match self.log.find_segment(self.next_offset).await {
                Some(segment) => {
                    self.scanner = Some(segment.scan(self.next_offset)?);
                }
                None => {
                    let oldest = self.log.oldest_offset().await;
                    if self.next_offset < oldest {
                        return Err(Error::SegmentNotFound(self.next_offset));
                    }
                    // The watermark points past the written tip, which can
                    // happen transiently after truncation. Park until it
                    // moves again.
                    self.wait_for_commit(hw).await?;
                }
            }
        }
    }

    async fn wait_for_commit(&mut self, observed_hw: i64) -> Result<()> {
        let wait = self.log.wait_for_hw_change(self.id, observed_hw);
        let shutdown = self.log.shutdown_notify().notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        if self.log.is_closed() {
            self.log.remove_hw_waiter(self.id);
            return Err(Error::Closed);
        }
        tokio::select! {
            _ = wait => Ok(()),
            _ = &mut shutdown => {
                self.log.remove_hw_waiter(self.id);
                Err(Error::Closed)
            }
        }
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        self.log.remove_hw_waiter(self.id);
    }
}
