//! Delete-based retention: whole segments are trimmed from the front of the
//! log until the configured limits are satisfied.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::segment::Segment;
use crate::Result;

/// Limits on a log's disk footprint. A zero value disables a rule; the rules
/// compose with OR, so exceeding any single enabled rule makes the oldest
/// segment eligible for deletion.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    /// Maximum total bytes across all segments
    pub max_bytes: u64,

    /// Maximum total message count across all segments
    pub max_messages: u64,

    /// Maximum age, judged by the oldest segment's newest record timestamp
    pub max_age: Duration,
}

impl RetentionPolicy {
    fn any_enabled(&self) -> bool {
        self.max_bytes > 0 || self.max_messages > 0 || !self.max_age.is_zero()
    }
}

/// Enforces a [`RetentionPolicy`] over an offset-sorted segment list.
#[derive(Debug)]
pub struct Cleaner {
    name: String,
    policy: RetentionPolicy,
}

impl Cleaner {
    pub fn new(name: impl Into<String>, policy: RetentionPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }

    /// Delete segments from the front of the list until every enabled rule
    /// is satisfied. The active (last) segment is never deleted. Each
    /// segment is removed from disk before it leaves the list, so a failed
    /// deletion stops the pass with the list reflecting exactly what was
    /// deleted.
    pub fn clean(&self, segments: &mut Vec<Arc<Segment>>) -> Result<()> {
        if !self.policy.any_enabled() {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        while segments.len() > 1 && self.oldest_is_deletable(segments, now) {
            let segment = segments[0].clone();
            segment.delete()?;
            info!(
                log = %self.name,
                base_offset = segment.base_offset(),
                "deleted segment past retention"
            );
            segments.remove(0);
        }
        Ok(())
    }

    fn oldest_is_deletable(&self, segments: &[Arc<Segment>], now: i64) -> bool {
        if self.policy.max_bytes > 0 {
            let total: u64 = segments.iter().map(|s| s.position()).sum();
            if total > self.policy.max_bytes {
                return true;
            }
        }
        if self.policy.max_messages > 0 {
            let total: i64 = segments.iter().map(|s| s.message_count()).sum();
            if total > self.policy.max_messages as i64 {
                return true;
            }
        }
        if !self.policy.max_age.is_zero() {
            let newest_ts = segments[0].max_timestamp();
            if newest_ts != 0 && now - newest_ts >= self.policy.max_age.as_millis() as i64 {
                return true;
            }
        }
        false
    }
}
