//! Journal records and their serialized form.
//!
//! A serialized record is the payload of an on-disk frame and also the unit
//! exchanged with replication peers:
//!
//! ```text
//! [index: i64 LE][asqn: i64 LE][data ...]
//! ```
//!
//! The record checksum is a CRC-32 over exactly these bytes.

use crate::{Error, Result};

/// Sentinel asqn meaning "this record carries no application sequence number".
pub const ASQN_IGNORE: i64 = -1;

pub const RECORD_HEADER_LEN: usize = 16;

const INDEX_OFFSET: usize = 0;
const ASQN_OFFSET: usize = 8;

/// A record stored in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub index: i64,
    pub asqn: i64,
    pub checksum: u32,
    pub data: Vec<u8>,
}

impl JournalRecord {
    /// Builds a record and computes its checksum.
    pub fn new(index: i64, asqn: i64, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let checksum = checksum_parts(&encode_header(index, asqn), &data);
        Self {
            index,
            asqn,
            checksum,
            data,
        }
    }

    /// The serialized record, as accepted by
    /// [`SegmentedJournal::append_serialized`](crate::SegmentedJournal::append_serialized).
    pub fn serialized(&self) -> Vec<u8> {
        serialize(self.index, self.asqn, &self.data)
    }

    /// Recomputes the checksum from the record contents.
    pub fn verify_checksum(&self) -> bool {
        checksum_parts(&encode_header(self.index, self.asqn), &self.data) == self.checksum
    }
}

/// Borrowed view of a serialized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView<'a> {
    pub index: i64,
    pub asqn: i64,
    pub data: &'a [u8],
}

impl RecordView<'_> {
    pub fn to_record(&self, checksum: u32) -> JournalRecord {
        JournalRecord {
            index: self.index,
            asqn: self.asqn,
            checksum,
            data: self.data.to_vec(),
        }
    }
}

pub fn encode_header(index: i64, asqn: i64) -> [u8; RECORD_HEADER_LEN] {
    let mut buf = [0u8; RECORD_HEADER_LEN];
    buf[INDEX_OFFSET..INDEX_OFFSET + 8].copy_from_slice(&index.to_le_bytes());
    buf[ASQN_OFFSET..ASQN_OFFSET + 8].copy_from_slice(&asqn.to_le_bytes());
    buf
}

pub fn serialize(index: i64, asqn: i64, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + data.len());
    buf.extend_from_slice(&encode_header(index, asqn));
    buf.extend_from_slice(data);
    buf
}

pub fn decode(serialized: &[u8]) -> Result<RecordView<'_>> {
    if serialized.len() < RECORD_HEADER_LEN {
        return Err(Error::corrupted(format!(
            "serialized record of {} bytes is shorter than its {} byte header",
            serialized.len(),
            RECORD_HEADER_LEN
        )));
    }
    let index = read_i64(serialized, INDEX_OFFSET);
    let asqn = read_i64(serialized, ASQN_OFFSET);
    Ok(RecordView {
        index,
        asqn,
        data: &serialized[RECORD_HEADER_LEN..],
    })
}

pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

fn checksum_parts(header: &[u8], data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header);
    hasher.update(data);
    hasher.finalize()
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}
