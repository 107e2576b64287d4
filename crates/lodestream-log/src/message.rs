//! Message type and the on-disk message set codec.
//!
//! A message set is a contiguous run of records, each framed as
//!
//! ```text
//! offset: i64 | timestamp: i64 | key_size: i32 | key | value_size: i32 | value | crc32: u32
//! ```
//!
//! All integers are big-endian and fixed width. A `key_size` of -1 marks an
//! absent key. The CRC covers every byte of the record that precedes it, so a
//! torn or bit-flipped record is detectable without trusting its length
//! fields alone.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use crc32fast::Hasher;

use crate::index::Entry;
use crate::{Error, Result};

/// Bytes before the key payload: offset(8) + timestamp(8) + key_size(4)
const RECORD_PREFIX: usize = 20;
const SIZE_WIDTH: usize = 4;
const CRC_WIDTH: usize = 4;

/// A single record in the log. Offsets are assigned by the log at append
/// time, never by the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional key
    pub key: Option<Bytes>,

    /// Opaque payload
    pub value: Bytes,

    /// Milliseconds since the epoch
    pub timestamp: i64,
}

impl Message {
    /// Create a message stamped with the current wall-clock time
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            key: None,
            value: value.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Create a keyed message
    pub fn with_key(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            value: value.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Override the timestamp
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Encoded size of this message on disk
    pub fn encoded_len(&self) -> usize {
        RECORD_PREFIX
            + self.key.as_ref().map(|k| k.len()).unwrap_or(0)
            + SIZE_WIDTH
            + self.value.len()
            + CRC_WIDTH
    }
}

/// Encode a batch of messages into a message set starting at `base_offset`,
/// assuming the set will be appended at `base_position` in the log file.
/// Returns the framed bytes and one index entry per message.
pub fn encode_message_set(
    base_offset: i64,
    base_position: i64,
    messages: &[Message],
) -> (Bytes, Vec<Entry>) {
    let total: usize = messages.iter().map(|m| m.encoded_len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    let mut entries = Vec::with_capacity(messages.len());

    for (i, message) in messages.iter().enumerate() {
        let offset = base_offset + i as i64;
        let start = buf.len();

        buf.put_i64(offset);
        buf.put_i64(message.timestamp);
        match &message.key {
            Some(key) => {
                buf.put_i32(key.len() as i32);
                buf.put_slice(key);
            }
            None => buf.put_i32(-1),
        }
        buf.put_i32(message.value.len() as i32);
        buf.put_slice(&message.value);

        let mut hasher = Hasher::new();
        hasher.update(&buf[start..]);
        buf.put_u32(hasher.finalize());

        entries.push(Entry {
            offset,
            position: base_position + start as i64,
            timestamp: message.timestamp,
        });
    }

    (buf.freeze(), entries)
}

/// Decode a single record from the front of `data`.
///
/// Returns the record's offset, the message, and the number of bytes
/// consumed. Fails with [`Error::CorruptFormat`] on truncation, a negative
/// size field, or a CRC mismatch.
pub fn decode_message(data: &[u8]) -> Result<(i64, Message, usize)> {
    if data.len() < RECORD_PREFIX {
        return Err(corrupt("record header truncated"));
    }

    let offset = i64::from_be_bytes(data[0..8].try_into().unwrap());
    let timestamp = i64::from_be_bytes(data[8..16].try_into().unwrap());
    let key_size = i32::from_be_bytes(data[16..20].try_into().unwrap());

    let mut pos = RECORD_PREFIX;
    let key = match key_size {
        -1 => None,
        n if n < 0 => return Err(corrupt("negative key size")),
        n => {
            let len = n as usize;
            if data.len() < pos + len {
                return Err(corrupt("record key truncated"));
            }
            let key = Bytes::copy_from_slice(&data[pos..pos + len]);
            pos += len;
            Some(key)
        }
    };

    if data.len() < pos + SIZE_WIDTH {
        return Err(corrupt("record value size truncated"));
    }
    let value_size = i32::from_be_bytes(data[pos..pos + SIZE_WIDTH].try_into().unwrap());
    if value_size < 0 {
        return Err(corrupt("negative value size"));
    }
    pos += SIZE_WIDTH;

    let value_len = value_size as usize;
    if data.len() < pos + value_len + CRC_WIDTH {
        return Err(corrupt("record value truncated"));
    }
    let value = Bytes::copy_from_slice(&data[pos..pos + value_len]);
    pos += value_len;

    let stored_crc = u32::from_be_bytes(data[pos..pos + CRC_WIDTH].try_into().unwrap());
    let mut hasher = Hasher::new();
    hasher.update(&data[..pos]);
    if hasher.finalize() != stored_crc {
        return Err(corrupt("record CRC mismatch"));
    }
    pos += CRC_WIDTH;

    Ok((
        offset,
        Message {
            key,
            value,
            timestamp,
        },
        pos,
    ))
}

/// Produce index entries for a preformed message set without re-encoding it.
///
/// The set is expected to carry dense offsets starting at `base_offset`,
/// which is what the replication path hands us. Any structural damage,
/// including a torn trailing record, is an error here; tolerating torn tails
/// is the recovery scan's job, not the append path's.
pub fn entries_for_message_set(
    base_offset: i64,
    base_position: i64,
    data: &[u8],
) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    let mut expected = base_offset;

    while pos < data.len() {
        let (offset, message, consumed) = decode_message(&data[pos..])?;
        if offset != expected {
            return Err(corrupt(format!(
                "message set offset {} does not follow {}",
                offset,
                expected - 1
            )));
        }
        entries.push(Entry {
            offset,
            position: base_position + pos as i64,
            timestamp: message.timestamp,
        });
        pos += consumed;
        expected += 1;
    }

    Ok(entries)
}

fn corrupt(reason: impl Into<String>) -> Error {
    Error::CorruptFormat(reason.into())
}
