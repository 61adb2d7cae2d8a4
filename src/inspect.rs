//! Read-only inspection and record dumps of segment files.
//!
//! Works on a copy of the file bytes and never opens the journal, so it is
//! safe to run against a directory another process is writing to and shows
//! damage that a journal open would heal.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::descriptor::{SegmentDescriptor, DESCRIPTOR_SIZE, VERSION_UNINITIALIZED};
use crate::file;
use crate::frame::{self, FrameRead};
use crate::record::{self, JournalRecord, RecordView};
use crate::Result;

/// What follows the last readable frame of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentTail {
    /// An invalid marker or the end of the file.
    Clean,
    /// A frame that fails validation; it is cut off when the journal opens.
    Torn { position: usize, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentSummary {
    pub id: u64,
    pub path: PathBuf,
    pub file_len: u64,
    /// Descriptor version byte; 0 for a pre-created segment never used.
    pub version: u8,
    pub start_index: Option<i64>,
    pub max_segment_size: Option<u32>,
    /// Last index recorded in the descriptor hint.
    pub hinted_last_index: Option<i64>,
    pub records: u64,
    pub first_index: Option<i64>,
    pub last_index: Option<i64>,
    pub last_asqn: Option<i64>,
    /// End of the last readable frame.
    pub end_position: usize,
    pub tail: SegmentTail,
}

impl SegmentSummary {
    fn uninitialized(id: u64, path: PathBuf, file_len: u64) -> Self {
        Self {
            id,
            path,
            file_len,
            version: VERSION_UNINITIALIZED,
            start_index: None,
            max_segment_size: None,
            hinted_last_index: None,
            records: 0,
            first_index: None,
            last_index: None,
            last_asqn: None,
            end_position: DESCRIPTOR_SIZE,
            tail: SegmentTail::Clean,
        }
    }
}

/// Summarizes every segment of journal `name` in `dir`, in id order.
pub fn inspect_journal(dir: &Path, name: &str) -> Result<Vec<SegmentSummary>> {
    file::discover_segments(dir, name)?
        .into_iter()
        .map(|id| inspect_segment(id, &file::segment_path(dir, name, id)))
        .collect()
}

pub fn inspect_segment(id: u64, path: &Path) -> Result<SegmentSummary> {
    let bytes = fs::read(path)?;
    let file_len = bytes.len() as u64;
    let Some(descriptor) = decode_descriptor(&bytes)? else {
        return Ok(SegmentSummary::uninitialized(id, path.to_path_buf(), file_len));
    };

    let mut summary = SegmentSummary {
        id,
        path: path.to_path_buf(),
        file_len,
        version: descriptor.version,
        start_index: Some(descriptor.start_index),
        max_segment_size: Some(descriptor.max_segment_size),
        hinted_last_index: descriptor
            .has_last_entry()
            .then_some(descriptor.last_index),
        records: 0,
        first_index: None,
        last_index: None,
        last_asqn: None,
        end_position: DESCRIPTOR_SIZE,
        tail: SegmentTail::Clean,
    };
    let (end_position, tail) = walk_frames(&bytes, &descriptor, |_, view| {
        summary.records += 1;
        summary.first_index.get_or_insert(view.index);
        summary.last_index = Some(view.index);
        if view.asqn != record::ASQN_IGNORE {
            summary.last_asqn = Some(view.asqn);
        }
        true
    });
    summary.end_position = end_position;
    summary.tail = tail;
    Ok(summary)
}

/// Hands every readable record of journal `name` from index `from` on to
/// `visit`, in index order, until it returns false. Like [`inspect_journal`]
/// it only reads the files, so a torn tail is skipped rather than repaired.
pub fn read_records(
    dir: &Path,
    name: &str,
    from: Option<i64>,
    mut visit: impl FnMut(JournalRecord) -> bool,
) -> Result<()> {
    let from = from.unwrap_or(i64::MIN);
    for id in file::discover_segments(dir, name)? {
        let bytes = fs::read(file::segment_path(dir, name, id))?;
        let Some(descriptor) = decode_descriptor(&bytes)? else {
            continue;
        };
        let mut stopped = false;
        let (_, tail) = walk_frames(&bytes, &descriptor, |checksum, view| {
            if view.index < from {
                return true;
            }
            stopped = !visit(view.to_record(checksum));
            !stopped
        });
        if stopped {
            break;
        }
        if let SegmentTail::Torn { position, reason } = tail {
            log::warn!("segment {id}: skipping torn tail at position {position}: {reason}");
        }
    }
    Ok(())
}

/// `None` for a pre-created segment that was never initialized.
fn decode_descriptor(bytes: &[u8]) -> Result<Option<SegmentDescriptor>> {
    if bytes.first().map_or(true, |version| *version == VERSION_UNINITIALIZED) {
        return Ok(None);
    }
    SegmentDescriptor::decode(bytes).map(Some)
}

/// Walks the frames after the descriptor while they hold consecutive
/// indexes and `visit` returns true. Returns the end of the last frame
/// visited and what stopped the walk.
fn walk_frames(
    bytes: &[u8],
    descriptor: &SegmentDescriptor,
    mut visit: impl FnMut(u32, &RecordView<'_>) -> bool,
) -> (usize, SegmentTail) {
    let limit = bytes.len().min(descriptor.max_segment_size as usize);
    let mut position = DESCRIPTOR_SIZE;
    let mut expected = descriptor.start_index;
    while position < limit {
        let torn = |reason: String| SegmentTail::Torn { position, reason };
        let (checksum, payload, frame_len) = match frame::read_frame(&bytes[position..limit]) {
            FrameRead::End => break,
            FrameRead::Corrupt(reason) => return (position, torn(reason.to_string())),
            FrameRead::Valid {
                checksum,
                payload,
                frame_len,
            } => (checksum, payload, frame_len),
        };
        let view = match record::decode(payload) {
            Ok(view) if view.index == expected => view,
            Ok(view) => {
                return (
                    position,
                    torn(format!("expected index {expected}, found {}", view.index)),
                )
            }
            Err(err) => return (position, torn(err.to_string())),
        };
        if !visit(checksum, &view) {
            break;
        }
        expected += 1;
        position += frame_len;
    }
    (position, SegmentTail::Clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SparseJournalIndex;
    use crate::loader::SegmentLoader;
    use crate::segment_writer::SegmentWriter;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn summarizes_records_and_reports_torn_tail() {
        let dir = tempdir().expect("tempdir");
        let loader = SegmentLoader::for_tests(dir.path(), 1024);
        let segment = loader.create_segment(1, 5).expect("create");
        let mut writer = SegmentWriter::open(
            Arc::clone(&segment),
            Arc::new(SparseJournalIndex::new(10)),
            record::ASQN_IGNORE,
        )
        .expect("writer");
        writer.append(3, b"first").expect("append");
        writer.append(record::ASQN_IGNORE, b"second").expect("append");
        let torn_at = writer.position();
        writer.append(9, b"third").expect("append");
        segment.flush().expect("flush");

        let clean = inspect_journal(dir.path(), "journal").expect("inspect");
        assert_eq!(clean.len(), 1);
        assert_eq!(clean[0].records, 3);
        assert_eq!(clean[0].first_index, Some(5));
        assert_eq!(clean[0].last_index, Some(7));
        assert_eq!(clean[0].last_asqn, Some(9));
        assert_eq!(clean[0].tail, SegmentTail::Clean);

        // Flip a payload byte of the third frame.
        let path = segment.path().to_path_buf();
        let mut bytes = fs::read(&path).expect("read");
        bytes[torn_at + frame::FRAME_HEADER_LEN + record::RECORD_HEADER_LEN] ^= 0xff;
        fs::write(&path, &bytes).expect("write");

        let torn = inspect_segment(1, &path).expect("inspect");
        assert_eq!(torn.records, 2);
        assert_eq!(torn.last_asqn, Some(3));
        assert_eq!(torn.end_position, torn_at);
        assert!(matches!(torn.tail, SegmentTail::Torn { position, .. } if position == torn_at));
    }

    #[test]
    fn reads_records_from_an_index_without_touching_the_files() {
        let dir = tempdir().expect("tempdir");
        let loader = SegmentLoader::for_tests(dir.path(), 256);
        let index: Arc<dyn crate::index::JournalIndex> = Arc::new(SparseJournalIndex::new(10));
        let first = loader.create_segment(1, 1).expect("create");
        let mut writer =
            SegmentWriter::open(Arc::clone(&first), Arc::clone(&index), record::ASQN_IGNORE)
                .expect("writer");
        for i in 1..=3 {
            writer.append(i, format!("a{i}").as_bytes()).expect("append");
        }
        let second = loader.create_segment(2, 4).expect("create");
        let mut writer =
            SegmentWriter::open(Arc::clone(&second), index, 3).expect("writer");
        for i in 4..=6 {
            writer.append(i, format!("b{i}").as_bytes()).expect("append");
        }
        first.flush().expect("flush");
        second.flush().expect("flush");
        drop(loader.create_uninitialized(3).expect("pre-create"));
        let before: Vec<Vec<u8>> = (1..=3)
            .map(|id| fs::read(file::segment_path(dir.path(), "journal", id)).expect("read"))
            .collect();

        let mut seen = Vec::new();
        read_records(dir.path(), "journal", Some(3), |record| {
            assert!(record.verify_checksum());
            seen.push((record.index, record.data));
            seen.len() < 3
        })
        .expect("read records");
        assert_eq!(
            seen,
            vec![(3, b"a3".to_vec()), (4, b"b4".to_vec()), (5, b"b5".to_vec())]
        );

        let after: Vec<Vec<u8>> = (1..=3)
            .map(|id| fs::read(file::segment_path(dir.path(), "journal", id)).expect("read"))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn pre_created_segment_is_reported_as_uninitialized() {
        let dir = tempdir().expect("tempdir");
        let loader = SegmentLoader::for_tests(dir.path(), 512);
        let pending = loader.create_uninitialized(4).expect("create");
        let summary = inspect_segment(4, pending.path()).expect("inspect");
        assert_eq!(summary.version, VERSION_UNINITIALIZED);
        assert_eq!(summary.records, 0);
        assert_eq!(summary.start_index, None);
    }
}
