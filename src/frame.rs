//! On-disk frame layout.
//!
//! ```text
//! [marker: u8][checksum: u32 LE][length: u32 LE][payload: length bytes][pad to 8]
//! ```
//!
//! The marker is written last. A zero marker means "nothing written here yet"
//! (freshly allocated space or a slot invalidated by the writer); any other
//! value besides [`FRAME_VALID`] is treated as damage.

use crate::record;

pub const FRAME_VALID: u8 = 1;
pub const FRAME_INVALID: u8 = 0;

pub const MARKER_LEN: usize = 1;
pub const METADATA_LEN: usize = 8;
pub const FRAME_HEADER_LEN: usize = MARKER_LEN + METADATA_LEN;
pub const FRAME_ALIGN: usize = 8;

const CHECKSUM_OFFSET: usize = MARKER_LEN;
const LENGTH_OFFSET: usize = MARKER_LEN + 4;

#[inline]
pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Total bytes a frame carrying `payload_len` bytes occupies.
#[inline]
pub fn frame_len(payload_len: usize) -> usize {
    align_up(FRAME_HEADER_LEN + payload_len, FRAME_ALIGN)
}

/// Smallest possible frame: a record with an empty data section.
pub const MIN_FRAME_LEN: usize = (FRAME_HEADER_LEN + record::RECORD_HEADER_LEN + FRAME_ALIGN - 1)
    & !(FRAME_ALIGN - 1);

pub fn encode_metadata(checksum: u32, length: u32) -> [u8; METADATA_LEN] {
    let mut buf = [0u8; METADATA_LEN];
    buf[0..4].copy_from_slice(&checksum.to_le_bytes());
    buf[4..8].copy_from_slice(&length.to_le_bytes());
    buf
}

/// Result of inspecting the bytes at a frame position.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameRead<'a> {
    /// A complete frame whose checksum matches its payload.
    Valid {
        checksum: u32,
        payload: &'a [u8],
        frame_len: usize,
    },
    /// No frame has been written here (or not enough room for one).
    End,
    /// Something was written but it is not a valid frame.
    Corrupt(&'static str),
}

/// Reads the frame starting at the beginning of `buf`.
///
/// `buf` must end at the last byte the caller is allowed to read (the segment
/// capacity for the writer, the published end position for readers).
pub fn read_frame(buf: &[u8]) -> FrameRead<'_> {
    if buf.len() < FRAME_HEADER_LEN {
        return match buf.first() {
            Some(&marker) if marker != FRAME_INVALID => FrameRead::Corrupt("truncated frame header"),
            _ => FrameRead::End,
        };
    }
    match buf[0] {
        FRAME_INVALID => return FrameRead::End,
        FRAME_VALID => {}
        _ => return FrameRead::Corrupt("unknown frame marker"),
    }

    let checksum = read_u32(buf, CHECKSUM_OFFSET);
    let length = read_u32(buf, LENGTH_OFFSET) as usize;
    if length < record::RECORD_HEADER_LEN {
        return FrameRead::Corrupt("frame length shorter than record header");
    }
    let payload_end = match FRAME_HEADER_LEN.checked_add(length) {
        Some(end) if end <= buf.len() => end,
        _ => return FrameRead::Corrupt("frame length exceeds buffer"),
    };
    let payload = &buf[FRAME_HEADER_LEN..payload_end];
    if record::checksum(payload) != checksum {
        return FrameRead::Corrupt("frame checksum mismatch");
    }
    FrameRead::Valid {
        checksum,
        payload,
        frame_len: frame_len(length).min(buf.len()),
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::serialize;

    fn encode_frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; frame_len(payload.len())];
        buf[0] = FRAME_VALID;
        buf[1..9].copy_from_slice(&encode_metadata(
            record::checksum(payload),
            payload.len() as u32,
        ));
        buf[9..9 + payload.len()].copy_from_slice(payload);
        buf
    }

    #[test]
    fn frames_are_eight_byte_aligned() {
        assert_eq!(frame_len(0), 16);
        assert_eq!(frame_len(7), 16);
        assert_eq!(frame_len(8), 24);
        assert_eq!(MIN_FRAME_LEN, 32);
    }

    #[test]
    fn valid_frame_is_decoded() {
        let payload = serialize(1, 10, b"hello");
        let buf = encode_frame(&payload);
        match read_frame(&buf) {
            FrameRead::Valid {
                payload: read,
                frame_len: len,
                ..
            } => {
                assert_eq!(read, payload.as_slice());
                assert_eq!(len, buf.len());
            }
            other => panic!("unexpected frame read: {other:?}"),
        }
    }

    #[test]
    fn zero_marker_is_end_of_data() {
        assert_eq!(read_frame(&[0u8; 64]), FrameRead::End);
        assert_eq!(read_frame(&[]), FrameRead::End);
    }

    #[test]
    fn torn_payload_is_corrupt() {
        let payload = serialize(1, 10, b"hello world");
        let mut buf = encode_frame(&payload);
        let last = FRAME_HEADER_LEN + payload.len() - 1;
        buf[last] ^= 0xFF;
        assert_eq!(read_frame(&buf), FrameRead::Corrupt("frame checksum mismatch"));

        let cut = encode_frame(&payload);
        assert_eq!(
            read_frame(&cut[..FRAME_HEADER_LEN + 4]),
            FrameRead::Corrupt("frame length exceeds buffer")
        );
    }

    #[test]
    fn unknown_marker_is_corrupt() {
        let mut buf = encode_frame(&serialize(1, 1, b"x"));
        buf[0] = 7;
        assert_eq!(read_frame(&buf), FrameRead::Corrupt("unknown frame marker"));
    }
}
