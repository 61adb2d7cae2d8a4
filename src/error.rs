use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("segment size {segment_size} is too small to hold a frame of {frame_len} bytes")]
    SegmentSizeTooSmall { segment_size: usize, frame_len: usize },

    #[error("invalid asqn {asqn}: must be greater than the last written asqn {last_asqn}")]
    InvalidAsqn { asqn: i64, last_asqn: i64 },

    #[error("invalid index {index}: expected the next index to be {expected}")]
    InvalidIndex { index: i64, expected: i64 },

    #[error("checksum mismatch for index {index}: expected {expected:#010x}, computed {actual:#010x}")]
    InvalidChecksum { index: i64, expected: u32, actual: u32 },

    #[error("corrupted journal: {0}")]
    CorruptedJournal(String),

    #[error("not enough disk space: {available} bytes available, {required} bytes required")]
    OutOfDiskSpace { available: u64, required: u64 },

    #[error("failed to flush segment {segment_id}: {source}")]
    Flush {
        segment_id: u64,
        #[source]
        source: io::Error,
    },

    #[error("unsupported descriptor version: {0}")]
    UnsupportedVersion(u8),

    #[error("access of {len} bytes at offset {offset} exceeds buffer of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("journal is closed")]
    Closed,

    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
}

impl Error {
    pub(crate) fn corrupted(msg: impl Into<String>) -> Self {
        Error::CorruptedJournal(msg.into())
    }

    /// Whether this error describes damaged on-disk data (as opposed to an
    /// environmental failure such as a full disk or a permission problem).
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::CorruptedJournal(_) | Error::UnsupportedVersion(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
