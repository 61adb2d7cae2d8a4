//! Forward cursor over the published records of one segment.

use std::sync::Arc;

use crate::frame::FrameRead;
use crate::record::{self, JournalRecord};
use crate::segment::{Segment, SEGMENT_DATA_OFFSET};
use crate::{Error, Result};

pub struct SegmentReader {
    segment: Arc<Segment>,
    position: usize,
    next_index: i64,
}

impl SegmentReader {
    /// Positions a reader at the first record of `segment`.
    pub fn new(segment: Arc<Segment>) -> Self {
        let next_index = segment.start_index();
        Self::at(segment, SEGMENT_DATA_OFFSET, next_index)
    }

    /// Positions a reader at a known frame boundary.
    ///
    /// `position` must be the start of the frame holding `next_index`, or the
    /// published end position if that record is not written yet.
    pub fn at(segment: Arc<Segment>, position: usize, next_index: i64) -> Self {
        Self {
            segment,
            position,
            next_index,
        }
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn next_index(&self) -> i64 {
        self.next_index
    }

    pub fn has_next(&self) -> bool {
        self.position < self.segment.end_position()
    }

    /// Reads the next record, or `None` at the end of the published data.
    pub fn next(&mut self) -> Result<Option<JournalRecord>> {
        let (record, frame_len) = match self.segment.read_frame(self.position)? {
            FrameRead::End => return Ok(None),
            FrameRead::Corrupt(reason) => {
                return Err(Error::corrupted(format!(
                    "segment {}: {reason} at published position {}",
                    self.segment.id(),
                    self.position
                )))
            }
            FrameRead::Valid {
                checksum,
                payload,
                frame_len,
            } => (record::decode(payload)?.to_record(checksum), frame_len),
        };
        if record.index != self.next_index {
            return Err(Error::corrupted(format!(
                "segment {}: expected index {} at position {}, found {}",
                self.segment.id(),
                self.next_index,
                self.position,
                record.index
            )));
        }
        self.position += frame_len;
        self.next_index += 1;
        Ok(Some(record))
    }

    /// Moves the cursor past every record below `index` without copying them.
    ///
    /// Returns the positions of the frames passed over, paired with their
    /// index, so callers can feed them to the sparse index.
    pub fn skip_to(&mut self, index: i64, mut visited: impl FnMut(i64, i64, usize)) -> Result<()> {
        while self.next_index < index {
            let frame_len = match self.segment.read_frame(self.position)? {
                FrameRead::Valid {
                    payload, frame_len, ..
                } => {
                    let view = record::decode(payload)?;
                    if view.index != self.next_index {
                        return Err(Error::corrupted(format!(
                            "segment {}: expected index {} at position {}, found {}",
                            self.segment.id(),
                            self.next_index,
                            self.position,
                            view.index
                        )));
                    }
                    visited(view.index, view.asqn, self.position);
                    frame_len
                }
                FrameRead::End => break,
                FrameRead::Corrupt(reason) => {
                    return Err(Error::corrupted(format!(
                        "segment {}: {reason} at published position {}",
                        self.segment.id(),
                        self.position
                    )))
                }
            };
            self.position += frame_len;
            self.next_index += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SparseJournalIndex;
    use crate::loader::SegmentLoader;
    use crate::record::ASQN_IGNORE;
    use crate::segment_writer::SegmentWriter;
    use tempfile::tempdir;

    #[test]
    fn reads_what_the_writer_published() {
        let dir = tempdir().expect("tempdir");
        let loader = SegmentLoader::for_tests(dir.path(), 4096);
        let segment = loader.create_segment(1, 10).expect("create");
        let mut writer = SegmentWriter::open(
            Arc::clone(&segment),
            Arc::new(SparseJournalIndex::new(100)),
            ASQN_IGNORE,
        )
        .expect("writer");

        let mut reader = SegmentReader::new(Arc::clone(&segment));
        assert!(!reader.has_next());
        assert_eq!(reader.next().expect("next"), None);

        for asqn in [1, 2, 3] {
            writer.append(asqn, format!("r{asqn}").as_bytes()).expect("append");
        }
        assert!(reader.has_next());
        let first = reader.next().expect("next").expect("record");
        assert_eq!(first.index, 10);
        assert_eq!(first.data, b"r1");

        let mut visited = Vec::new();
        reader
            .skip_to(12, |index, _, _| visited.push(index))
            .expect("skip");
        assert_eq!(visited, vec![11]);
        let last = reader.next().expect("next").expect("record");
        assert_eq!((last.index, last.asqn), (12, 3));
        assert!(!reader.has_next());

        writer.append(4, b"r4").expect("append");
        assert_eq!(reader.next().expect("next").map(|r| r.index), Some(13));
    }
}
