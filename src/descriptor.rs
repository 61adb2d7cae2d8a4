//! Segment descriptor: the fixed header at offset 0 of every segment file.
//!
//! The first byte selects the encoding. Version 0 means the file was
//! allocated but never initialized. Each known version has a codec
//! implementing [`DescriptorCodec`]; unknown versions fail closed.
//!
//! Current layout (version 2):
//!
//! ```text
//! [version: u8]
//! [block A: schema_version u16 | block_b_len u16 | checksum(block B) u32]
//! [block B: id u64 | start_index i64 | max_segment_size u32 | last_index i64 | last_position u32]
//! ```
//!
//! Legacy layout (version 1), read-only in practice:
//!
//! ```text
//! [version: u8][id u64][start_index i64][max_segment_size u32][max_entries u32][updated i64][locked u8]
//! ```

use crate::{Error, Result};

/// Bytes reserved at the start of every segment for the descriptor.
pub const DESCRIPTOR_SIZE: usize = 64;

pub const VERSION_UNINITIALIZED: u8 = 0;
pub const VERSION_LEGACY: u8 = 1;
pub const VERSION_CURRENT: u8 = 2;

pub const SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub version: u8,
    pub schema_version: u16,
    pub id: u64,
    pub start_index: i64,
    pub max_segment_size: u32,
    /// Index of the last record when the descriptor was last written, 0 if unknown.
    pub last_index: i64,
    /// Position of the frame holding `last_index`, 0 if unknown.
    pub last_position: u32,
}

impl SegmentDescriptor {
    pub fn new(id: u64, start_index: i64, max_segment_size: u32) -> Self {
        Self {
            version: VERSION_CURRENT,
            schema_version: SCHEMA_VERSION,
            id,
            start_index,
            max_segment_size,
            last_index: 0,
            last_position: 0,
        }
    }

    pub fn with_last_entry(mut self, last_index: i64, last_position: u32) -> Self {
        self.last_index = last_index;
        self.last_position = last_position;
        self
    }

    /// Whether the descriptor carries a fast-recovery hint.
    pub fn has_last_entry(&self) -> bool {
        self.last_position > 0 && self.last_index >= self.start_index
    }

    /// Encodes with the current codec.
    pub fn encode(&self) -> Result<[u8; DESCRIPTOR_SIZE]> {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        CurrentCodec.encode(self, &mut buf)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let version = *buf
            .first()
            .ok_or_else(|| Error::corrupted("empty segment descriptor"))?;
        codec_for(version)?.decode(buf)
    }
}

/// Encoding contract shared by every descriptor version.
pub trait DescriptorCodec {
    fn version(&self) -> u8;
    fn encoded_len(&self) -> usize;
    fn encode(&self, descriptor: &SegmentDescriptor, buf: &mut [u8]) -> Result<()>;
    fn decode(&self, buf: &[u8]) -> Result<SegmentDescriptor>;
}

pub fn codec_for(version: u8) -> Result<&'static dyn DescriptorCodec> {
    match version {
        VERSION_LEGACY => Ok(&LegacyCodec),
        VERSION_CURRENT => Ok(&CurrentCodec),
        VERSION_UNINITIALIZED => Err(Error::corrupted("segment descriptor is not initialized")),
        other => Err(Error::UnsupportedVersion(other)),
    }
}

pub struct CurrentCodec;

const BLOCK_A_OFFSET: usize = 1;
const BLOCK_A_LEN: usize = 8;
const BLOCK_B_OFFSET: usize = BLOCK_A_OFFSET + BLOCK_A_LEN;
const BLOCK_B_LEN: usize = 32;

impl DescriptorCodec for CurrentCodec {
    fn version(&self) -> u8 {
        VERSION_CURRENT
    }

    fn encoded_len(&self) -> usize {
        BLOCK_B_OFFSET + BLOCK_B_LEN
    }

    fn encode(&self, descriptor: &SegmentDescriptor, buf: &mut [u8]) -> Result<()> {
        check_len(buf, self.encoded_len())?;
        let mut block_b = [0u8; BLOCK_B_LEN];
        block_b[0..8].copy_from_slice(&descriptor.id.to_le_bytes());
        block_b[8..16].copy_from_slice(&descriptor.start_index.to_le_bytes());
        block_b[16..20].copy_from_slice(&descriptor.max_segment_size.to_le_bytes());
        block_b[20..28].copy_from_slice(&descriptor.last_index.to_le_bytes());
        block_b[28..32].copy_from_slice(&descriptor.last_position.to_le_bytes());

        buf[0] = VERSION_CURRENT;
        buf[BLOCK_A_OFFSET..BLOCK_A_OFFSET + 2].copy_from_slice(&SCHEMA_VERSION.to_le_bytes());
        buf[BLOCK_A_OFFSET + 2..BLOCK_A_OFFSET + 4]
            .copy_from_slice(&(BLOCK_B_LEN as u16).to_le_bytes());
        buf[BLOCK_A_OFFSET + 4..BLOCK_A_OFFSET + 8]
            .copy_from_slice(&crc32fast::hash(&block_b).to_le_bytes());
        buf[BLOCK_B_OFFSET..BLOCK_B_OFFSET + BLOCK_B_LEN].copy_from_slice(&block_b);
        Ok(())
    }

    fn decode(&self, buf: &[u8]) -> Result<SegmentDescriptor> {
        check_len(buf, self.encoded_len())?;
        if buf[0] != VERSION_CURRENT {
            return Err(Error::UnsupportedVersion(buf[0]));
        }
        let schema_version = u16::from_le_bytes([buf[BLOCK_A_OFFSET], buf[BLOCK_A_OFFSET + 1]]);
        let block_b_len =
            u16::from_le_bytes([buf[BLOCK_A_OFFSET + 2], buf[BLOCK_A_OFFSET + 3]]) as usize;
        if block_b_len != BLOCK_B_LEN {
            return Err(Error::corrupted(format!(
                "descriptor block length {block_b_len}, expected {BLOCK_B_LEN}"
            )));
        }
        let checksum = read_u32(buf, BLOCK_A_OFFSET + 4);
        let block_b = &buf[BLOCK_B_OFFSET..BLOCK_B_OFFSET + BLOCK_B_LEN];
        let actual = crc32fast::hash(block_b);
        if actual != checksum {
            return Err(Error::corrupted(format!(
                "descriptor checksum mismatch: stored {checksum:#010x}, computed {actual:#010x}"
            )));
        }
        Ok(SegmentDescriptor {
            version: VERSION_CURRENT,
            schema_version,
            id: read_u64(block_b, 0),
            start_index: read_u64(block_b, 8) as i64,
            max_segment_size: read_u32(block_b, 16),
            last_index: read_u64(block_b, 20) as i64,
            last_position: read_u32(block_b, 28),
        })
    }
}

pub struct LegacyCodec;

impl DescriptorCodec for LegacyCodec {
    fn version(&self) -> u8 {
        VERSION_LEGACY
    }

    fn encoded_len(&self) -> usize {
        34
    }

    fn encode(&self, descriptor: &SegmentDescriptor, buf: &mut [u8]) -> Result<()> {
        check_len(buf, self.encoded_len())?;
        buf[0] = VERSION_LEGACY;
        buf[1..9].copy_from_slice(&descriptor.id.to_le_bytes());
        buf[9..17].copy_from_slice(&descriptor.start_index.to_le_bytes());
        buf[17..21].copy_from_slice(&descriptor.max_segment_size.to_le_bytes());
        // max_entries, updated and locked are no longer interpreted.
        buf[21..34].fill(0);
        Ok(())
    }

    fn decode(&self, buf: &[u8]) -> Result<SegmentDescriptor> {
        check_len(buf, self.encoded_len())?;
        if buf[0] != VERSION_LEGACY {
            return Err(Error::UnsupportedVersion(buf[0]));
        }
        Ok(SegmentDescriptor {
            version: VERSION_LEGACY,
            schema_version: 0,
            id: read_u64(buf, 1),
            start_index: read_u64(buf, 9) as i64,
            max_segment_size: read_u32(buf, 17),
            last_index: 0,
            last_position: 0,
        })
    }
}

fn check_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(Error::corrupted(format!(
            "descriptor buffer of {} bytes, need {needed}",
            buf.len()
        )));
    }
    Ok(())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_descriptor_round_trip() {
        let descriptor = SegmentDescriptor::new(3, 101, 1 << 20).with_last_entry(150, 4096);
        let buf = descriptor.encode().expect("encode");
        assert_eq!(buf[0], VERSION_CURRENT);
        let decoded = SegmentDescriptor::decode(&buf).expect("decode");
        assert_eq!(decoded, descriptor);
        assert!(decoded.has_last_entry());
    }

    #[test]
    fn corrupted_block_fails_checksum() {
        let mut buf = SegmentDescriptor::new(1, 1, 4096).encode().expect("encode");
        buf[BLOCK_B_OFFSET + 3] ^= 0x40;
        let err = SegmentDescriptor::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::CorruptedJournal(_)));
    }

    #[test]
    fn legacy_descriptor_has_no_hint() {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        LegacyCodec
            .encode(&SegmentDescriptor::new(4, 77, 8192), &mut buf)
            .expect("encode legacy");
        let decoded = SegmentDescriptor::decode(&buf).expect("decode legacy");
        assert_eq!(decoded.version, VERSION_LEGACY);
        assert_eq!(decoded.id, 4);
        assert_eq!(decoded.start_index, 77);
        assert_eq!(decoded.max_segment_size, 8192);
        assert!(!decoded.has_last_entry());
    }

    #[test]
    fn unknown_and_uninitialized_versions_fail_closed() {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        assert!(SegmentDescriptor::decode(&buf).is_err());
        buf[0] = 42;
        assert!(matches!(
            SegmentDescriptor::decode(&buf),
            Err(Error::UnsupportedVersion(42))
        ));
    }

    #[test]
    fn zeroed_hint_is_not_trusted() {
        let descriptor = SegmentDescriptor::new(1, 10, 4096)
            .with_last_entry(12, 200)
            .with_last_entry(0, 0);
        assert!(!descriptor.has_last_entry());
    }
}
