//! Durable, append-only commit log for the Lodestream streaming platform.
//!
//! The log persists an ordered sequence of messages under a single
//! directory, split into fixed-size segments so old data is cheap to delete
//! and appends stay O(1). Each segment pairs a `.log` data file with a
//! memory-mapped `.index` for O(log n) lookup by offset or timestamp.
//! Retention, truncation for replica reconciliation, crash recovery of torn
//! writes, and high watermark coordination for blocking readers all live
//! here; replication, cluster metadata, and the RPC surface are the
//! enclosing server's business.
//!
//! ```no_run
//! use lodestream_log::{CommitLog, LogConfig, Message};
//!
//! # async fn example() -> lodestream_log::Result<()> {
//! let log = CommitLog::open(LogConfig::new("./data/orders-0")).await?;
//! let offsets = log.append(&[Message::new("payload")]).await?;
//! log.set_high_watermark(offsets[offsets.len() - 1]);
//!
//! let mut reader = log.reader(0);
//! let message = reader.next().await?;
//! # drop(message);
//! log.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cleaner;
pub mod commitlog;
pub mod config;
pub mod error;
pub mod index;
pub mod message;
pub mod reader;
pub mod segment;

pub use cleaner::{Cleaner, RetentionPolicy};
pub use commitlog::CommitLog;
pub use config::LogConfig;
pub use error::{Error, Result};
pub use index::Entry;
pub use message::Message;
pub use reader::LogReader;
pub use segment::{Segment, SegmentScanner};
