use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Maximum bytes a segment may hold before a new one is rolled.
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 1024 * 1024 * 1024; // 1 GiB

/// How often the high watermark is checkpointed to disk.
pub const DEFAULT_HW_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// How often the retention policy is enforced.
pub const DEFAULT_CLEANER_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Configuration for a [`CommitLog`](crate::CommitLog).
///
/// A zero value means "use the default" for `max_segment_bytes` and the two
/// intervals, and "disabled" for the retention limits and `log_roll_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory holding the log's segment and checkpoint files
    pub path: PathBuf,

    /// Maximum bytes a segment can contain before a new one is rolled
    pub max_segment_bytes: u64,

    /// Retention by total log bytes (0 = unlimited)
    pub max_log_bytes: u64,

    /// Retention by total message count (0 = unlimited)
    pub max_log_messages: u64,

    /// Retention by age (zero = unlimited)
    pub max_log_age: Duration,

    /// Maximum time before the active segment is rolled regardless of size
    /// (zero = disabled)
    pub log_roll_time: Duration,

    /// Frequency of the retention pass
    pub cleaner_interval: Duration,

    /// Frequency of the high watermark checkpoint
    pub hw_checkpoint_interval: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
            max_segment_bytes: 0,
            max_log_bytes: 0,
            max_log_messages: 0,
            max_log_age: Duration::ZERO,
            log_roll_time: Duration::ZERO,
            cleaner_interval: Duration::ZERO,
            hw_checkpoint_interval: Duration::ZERO,
        }
    }
}

impl LogConfig {
    /// Create a configuration rooted at the given directory
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the maximum segment size in bytes
    pub fn with_max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    /// Set the retention limit in bytes
    pub fn with_max_log_bytes(mut self, bytes: u64) -> Self {
        self.max_log_bytes = bytes;
        self
    }

    /// Set the retention limit in messages
    pub fn with_max_log_messages(mut self, messages: u64) -> Self {
        self.max_log_messages = messages;
        self
    }

    /// Set the retention limit by age
    pub fn with_max_log_age(mut self, age: Duration) -> Self {
        self.max_log_age = age;
        self
    }

    /// Set the time-based segment roll threshold
    pub fn with_log_roll_time(mut self, roll_time: Duration) -> Self {
        self.log_roll_time = roll_time;
        self
    }

    /// Set the retention pass frequency
    pub fn with_cleaner_interval(mut self, interval: Duration) -> Self {
        self.cleaner_interval = interval;
        self
    }

    /// Set the high watermark checkpoint frequency
    pub fn with_hw_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.hw_checkpoint_interval = interval;
        self
    }

    /// Apply defaults to zero-valued settings and validate the result.
    ///
    /// Segment positions are stored as 32-bit values in the index, so the
    /// segment cap must fit in a `u32`.
    pub(crate) fn normalized(mut self) -> Result<Self> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("path is empty".to_string()));
        }
        if self.max_segment_bytes == 0 {
            self.max_segment_bytes = DEFAULT_MAX_SEGMENT_BYTES;
        }
        if self.max_segment_bytes > u32::MAX as u64 {
            return Err(Error::InvalidConfig(format!(
                "max_segment_bytes {} exceeds the 4 GiB segment limit",
                self.max_segment_bytes
            )));
        }
        if self.hw_checkpoint_interval.is_zero() {
            self.hw_checkpoint_interval = DEFAULT_HW_CHECKPOINT_INTERVAL;
        }
        if self.cleaner_interval.is_zero() {
            self.cleaner_interval = DEFAULT_CLEANER_INTERVAL;
        }
        Ok(self)
    }
}
