use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("corrupt log data: {0}")]
    CorruptFormat(String),

    #[error("no index entry matches the requested offset or timestamp")]
    EntryNotFound,

    #[error("offset {0} is outside the retained log range")]
    SegmentNotFound(i64),

    #[error("segment with base offset {0} already exists")]
    SegmentExists(i64),

    #[error("segment cannot accept the write")]
    SegmentFull,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("commit log is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
