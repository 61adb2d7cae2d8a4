//! Appends framed records to a single segment.
//!
//! # Design
//!
//! - The frame slot at the write position always has a zero marker. Every
//!   append zeroes the marker of the following slot before setting its own,
//!   so a crash can never expose stale frames past the last valid one.
//! - The payload and metadata are written before the marker, and the new end
//!   position is published last.
//! - On open the write position is recovered from the descriptor hint when
//!   one is present and checks out, otherwise by scanning from the start.

use std::sync::Arc;

use crate::frame::{self, FrameRead, FRAME_HEADER_LEN, FRAME_INVALID, FRAME_VALID, MARKER_LEN};
use crate::index::JournalIndex;
use crate::record::{self, JournalRecord, ASQN_IGNORE, RECORD_HEADER_LEN};
use crate::segment::{Segment, SEGMENT_DATA_OFFSET};
use crate::{Error, Result};

/// Result of an append attempt on one segment.
#[derive(Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(JournalRecord),
    /// The record does not fit in what is left of the segment.
    SegmentFull,
}

pub struct SegmentWriter {
    segment: Arc<Segment>,
    index: Arc<dyn JournalIndex>,
    /// Next write position; always holds an invalid marker.
    position: usize,
    last_index: i64,
    last_asqn: i64,
    /// Position of the frame holding `last_index`, 0 when the segment is empty.
    last_position: usize,
    /// Last asqn of the preceding segments, restored when this one is emptied.
    asqn_floor: i64,
}

impl SegmentWriter {
    /// Recovers the write position of `segment` from its contents.
    pub fn open(segment: Arc<Segment>, index: Arc<dyn JournalIndex>, asqn_floor: i64) -> Result<Self> {
        let mut writer = Self {
            position: SEGMENT_DATA_OFFSET,
            last_index: segment.start_index() - 1,
            last_asqn: asqn_floor,
            last_position: 0,
            asqn_floor,
            segment,
            index,
        };
        writer.recover()?;
        Ok(writer)
    }

    /// Continues writing where the segment's published state ends.
    pub fn resume(segment: Arc<Segment>, index: Arc<dyn JournalIndex>, asqn_floor: i64) -> Self {
        Self {
            position: segment.end_position(),
            last_index: segment.last_index(),
            last_asqn: segment.last_asqn(),
            last_position: segment.last_position().unwrap_or(0),
            asqn_floor,
            segment,
            index,
        }
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn last_index(&self) -> i64 {
        self.last_index
    }

    pub fn last_asqn(&self) -> i64 {
        self.last_asqn
    }

    pub fn next_index(&self) -> i64 {
        self.last_index + 1
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_empty(&self) -> bool {
        self.last_index < self.segment.start_index()
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    fn recover(&mut self) -> Result<()> {
        let descriptor = self.segment.descriptor()?;
        if descriptor.has_last_entry() {
            match self.recover_from_hint(descriptor.last_index, descriptor.last_position as usize) {
                Ok(true) => {
                    log::debug!(
                        "segment {} recovered from descriptor hint at index {}",
                        self.segment.id(),
                        self.last_index
                    );
                    return Ok(());
                }
                Ok(false) => {}
                Err(err) => log::debug!(
                    "segment {} descriptor hint unusable: {err}",
                    self.segment.id()
                ),
            }
            self.reset_cursor();
        }
        self.scan(None)?;
        self.publish();
        Ok(())
    }

    fn recover_from_hint(&mut self, last_index: i64, last_position: usize) -> Result<bool> {
        let capacity = self.segment.max_size();
        if last_position < SEGMENT_DATA_OFFSET || last_position >= capacity {
            return Ok(false);
        }
        let buf = self
            .segment
            .buffer()
            .slice(last_position, capacity - last_position)?;
        let verified = match frame::read_frame(buf) {
            FrameRead::Valid { payload, .. } => record::decode(payload)?.index == last_index,
            _ => false,
        };
        if !verified {
            return Ok(false);
        }

        self.position = last_position;
        self.last_index = last_index - 1;
        // Without an asqn-carrying record after the hint the last asqn would
        // be unknown, so only a full scan can restore it.
        if !self.scan(None)? {
            return Ok(false);
        }
        self.publish();
        Ok(true)
    }

    /// Walks valid frames from the write position, stopping at the first
    /// empty or invalid slot, or after `stop_after`. Returns whether any
    /// scanned record carried an asqn.
    fn scan(&mut self, stop_after: Option<i64>) -> Result<bool> {
        let segment = Arc::clone(&self.segment);
        let buffer = segment.buffer();
        let capacity = buffer.len();
        let mut saw_asqn = false;

        while self.position < capacity {
            let expected = self.last_index + 1;
            let buf = buffer.slice(self.position, capacity - self.position)?;
            match frame::read_frame(buf) {
                FrameRead::End => break,
                FrameRead::Corrupt(reason) => {
                    log::warn!(
                        "segment {}: {reason} at position {}, treating as end of data",
                        segment.id(),
                        self.position
                    );
                    buffer.write_u8(self.position, FRAME_INVALID)?;
                    break;
                }
                FrameRead::Valid {
                    payload, frame_len, ..
                } => {
                    let view = record::decode(payload)?;
                    if view.index != expected {
                        if self.position == SEGMENT_DATA_OFFSET {
                            return Err(Error::corrupted(format!(
                                "segment {} starts with index {}, expected {expected}",
                                segment.id(),
                                view.index
                            )));
                        }
                        log::warn!(
                            "segment {}: found index {} at position {}, expected {expected}; treating as end of data",
                            segment.id(),
                            view.index,
                            self.position
                        );
                        buffer.write_u8(self.position, FRAME_INVALID)?;
                        break;
                    }
                    self.index.index(view.index, view.asqn, self.position);
                    if view.asqn != ASQN_IGNORE {
                        self.last_asqn = view.asqn;
                        saw_asqn = true;
                    }
                    self.last_index = view.index;
                    self.last_position = self.position;
                    self.position += frame_len;
                    if stop_after == Some(view.index) {
                        break;
                    }
                }
            }
        }
        Ok(saw_asqn)
    }

    fn reset_cursor(&mut self) {
        self.position = SEGMENT_DATA_OFFSET;
        self.last_index = self.segment.start_index() - 1;
        self.last_asqn = self.asqn_floor;
        self.last_position = 0;
    }

    fn publish(&self) {
        self.segment.publish(
            self.position,
            self.last_position,
            self.last_index,
            self.last_asqn,
        );
    }

    // ------------------------------------------------------------------------
    // Appends
    // ------------------------------------------------------------------------

    fn check_asqn(&self, asqn: i64) -> Result<()> {
        if asqn != ASQN_IGNORE && asqn <= self.last_asqn {
            return Err(Error::InvalidAsqn {
                asqn,
                last_asqn: self.last_asqn,
            });
        }
        Ok(())
    }

    /// Returns the write position if a frame for `payload_len` bytes fits.
    fn reserve(&self, payload_len: usize) -> Result<Option<usize>> {
        let frame_len = frame::frame_len(payload_len);
        let capacity = self.segment.max_size();
        match self.position.checked_add(frame_len) {
            Some(end) if end <= capacity => Ok(Some(self.position)),
            _ if self.is_empty() => Err(Error::SegmentSizeTooSmall {
                segment_size: capacity,
                frame_len,
            }),
            _ => Ok(None),
        }
    }

    /// Appends a record with the next index.
    pub fn append(&mut self, asqn: i64, data: &[u8]) -> Result<AppendOutcome> {
        self.check_asqn(asqn)?;
        let index = self.next_index();
        let payload_len = RECORD_HEADER_LEN + data.len();
        let Some(position) = self.reserve(payload_len)? else {
            return Ok(AppendOutcome::SegmentFull);
        };

        let buffer = self.segment.buffer();
        let payload_offset = position + FRAME_HEADER_LEN;
        buffer.write(payload_offset, &record::encode_header(index, asqn))?;
        buffer.write(payload_offset + RECORD_HEADER_LEN, data)?;
        let checksum = record::checksum(buffer.slice(payload_offset, payload_len)?);

        self.commit(position, payload_len, checksum, index, asqn)?;
        Ok(AppendOutcome::Appended(JournalRecord {
            index,
            asqn,
            checksum,
            data: data.to_vec(),
        }))
    }

    /// Appends an already serialized record, verifying its index, asqn and
    /// checksum. A checksum mismatch leaves the segment unchanged.
    pub fn append_serialized(&mut self, checksum: u32, serialized: &[u8]) -> Result<AppendOutcome> {
        let view = record::decode(serialized)?;
        self.check_asqn(view.asqn)?;
        let expected = self.next_index();
        if view.index != expected {
            return Err(Error::InvalidIndex {
                index: view.index,
                expected,
            });
        }
        let Some(position) = self.reserve(serialized.len())? else {
            return Ok(AppendOutcome::SegmentFull);
        };

        let buffer = self.segment.buffer();
        let payload_offset = position + FRAME_HEADER_LEN;
        buffer.write(payload_offset, serialized)?;
        let actual = record::checksum(buffer.slice(payload_offset, serialized.len())?);
        if actual != checksum {
            // The marker at `position` is still invalid, so nothing was written.
            return Err(Error::InvalidChecksum {
                index: view.index,
                expected: checksum,
                actual,
            });
        }

        self.commit(position, serialized.len(), checksum, view.index, view.asqn)?;
        Ok(AppendOutcome::Appended(view.to_record(checksum)))
    }

    fn commit(
        &mut self,
        position: usize,
        payload_len: usize,
        checksum: u32,
        index: i64,
        asqn: i64,
    ) -> Result<()> {
        let length = u32::try_from(payload_len).map_err(|_| Error::SegmentSizeTooSmall {
            segment_size: self.segment.max_size(),
            frame_len: frame::frame_len(payload_len),
        })?;
        let buffer = self.segment.buffer();
        let next = position + frame::frame_len(payload_len);
        if next < buffer.len() {
            buffer.write_u8(next, FRAME_INVALID)?;
        }
        buffer.write(position + MARKER_LEN, &frame::encode_metadata(checksum, length))?;
        buffer.write_u8(position, FRAME_VALID)?;

        self.position = next;
        self.last_index = index;
        self.last_position = position;
        if asqn != ASQN_IGNORE {
            self.last_asqn = asqn;
        }
        self.index.index(index, asqn, position);
        self.publish();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Truncation & descriptor
    // ------------------------------------------------------------------------

    /// Discards every record after `index` and forces the segment to disk.
    ///
    /// Must only be called while no reader can access the segment.
    pub fn truncate(&mut self, index: i64) -> Result<()> {
        if index >= self.last_index {
            return Ok(());
        }
        self.index.delete_after(index);
        self.reset_cursor();
        if index >= self.segment.start_index() {
            self.scan(Some(index))?;
        }
        if self.position < self.segment.max_size() {
            self.segment.buffer().write_u8(self.position, FRAME_INVALID)?;
        }
        self.publish();
        self.segment.reset_descriptor_hint()?;
        self.segment.flush()
    }

    /// Records the last entry in the descriptor so the next open can skip the scan.
    pub fn update_descriptor(&self) -> Result<()> {
        if self.last_position == 0 {
            return Ok(());
        }
        self.segment
            .update_descriptor(self.last_index, self.last_position)
    }
}
