//! A single memory-mapped segment file.
//!
//! # Design
//!
//! A segment is shared through `Arc` between the segment table, the tail
//! writer and any readers positioned in it. The writer appends beyond the
//! published end position and then publishes it with `Release`; readers load
//! it with `Acquire` and never look past it. The mapping is released when the
//! last `Arc` is dropped, so deleting a segment only deals with the file.
//!
//! Deletion is deferred while readers are attached: the file is renamed to its
//! marked-for-deletion name right away and removed by the last reader to
//! detach.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::descriptor::{SegmentDescriptor, DESCRIPTOR_SIZE};
use crate::file;
use crate::frame::{self, FrameRead};
use crate::mmap::MappedBuffer;
use crate::record::ASQN_IGNORE;
use crate::{Error, Result};

/// Offset where frames begin (after the descriptor).
pub const SEGMENT_DATA_OFFSET: usize = DESCRIPTOR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentLifecycle {
    Open,
    MarkedForDeletion,
    Closed,
}

#[derive(Debug)]
struct SegmentState {
    lifecycle: SegmentLifecycle,
    readers: HashSet<u64>,
    marked_path: Option<PathBuf>,
}

pub struct Segment {
    id: u64,
    start_index: i64,
    path: PathBuf,
    buffer: MappedBuffer,
    descriptor: Mutex<SegmentDescriptor>,
    end_position: AtomicUsize,
    last_position: AtomicUsize,
    last_index: AtomicI64,
    last_asqn: AtomicI64,
    state: Mutex<SegmentState>,
}

impl Segment {
    pub(crate) fn new(path: PathBuf, buffer: MappedBuffer, descriptor: SegmentDescriptor) -> Self {
        Self {
            id: descriptor.id,
            start_index: descriptor.start_index,
            path,
            buffer,
            descriptor: Mutex::new(descriptor),
            end_position: AtomicUsize::new(SEGMENT_DATA_OFFSET),
            last_position: AtomicUsize::new(0),
            last_index: AtomicI64::new(descriptor.start_index - 1),
            last_asqn: AtomicI64::new(ASQN_IGNORE),
            state: Mutex::new(SegmentState {
                lifecycle: SegmentLifecycle::Open,
                readers: HashSet::new(),
                marked_path: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start_index(&self) -> i64 {
        self.start_index
    }

    /// Capacity of the segment file in bytes, descriptor included.
    pub fn max_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index of the last published record, `start_index - 1` when empty.
    pub fn last_index(&self) -> i64 {
        self.last_index.load(Ordering::Acquire)
    }

    /// Last asqn written in this segment or carried over from the previous one.
    pub fn last_asqn(&self) -> i64 {
        self.last_asqn.load(Ordering::Acquire)
    }

    pub fn end_position(&self) -> usize {
        self.end_position.load(Ordering::Acquire)
    }

    /// Position of the frame holding `last_index`, if the segment has one.
    pub fn last_position(&self) -> Option<usize> {
        match self.last_position.load(Ordering::Acquire) {
            0 => None,
            position => Some(position),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_index() < self.start_index
    }

    pub fn descriptor(&self) -> Result<SegmentDescriptor> {
        self.descriptor
            .lock()
            .map(|descriptor| *descriptor)
            .map_err(|_| Error::Poisoned("segment descriptor"))
    }

    pub(crate) fn buffer(&self) -> &MappedBuffer {
        &self.buffer
    }

    /// Makes everything below `end_position` visible to readers.
    ///
    /// `end_position` is stored before `last_index`, so a reader that observes
    /// a last index always finds its frame below the end position.
    pub(crate) fn publish(&self, end_position: usize, last_position: usize, last_index: i64, last_asqn: i64) {
        self.end_position.store(end_position, Ordering::Release);
        self.last_position.store(last_position, Ordering::Release);
        self.last_asqn.store(last_asqn, Ordering::Release);
        self.last_index.store(last_index, Ordering::Release);
    }

    /// Reads the frame at `position`, bounded by the published end position.
    pub fn read_frame(&self, position: usize) -> Result<FrameRead<'_>> {
        let end = self.end_position();
        if position < SEGMENT_DATA_OFFSET || position >= end {
            return Ok(FrameRead::End);
        }
        let buf = self.buffer.slice(position, end - position)?;
        Ok(frame::read_frame(buf))
    }

    /// Rewrites the descriptor with a fresh recovery hint and forces it to disk.
    ///
    /// Legacy descriptors are upgraded to the current version here.
    pub(crate) fn update_descriptor(&self, last_index: i64, last_position: usize) -> Result<()> {
        let last_position = u32::try_from(last_position)
            .map_err(|_| Error::InvalidConfig("segment position exceeds 32 bits"))?;
        let mut descriptor = self
            .descriptor
            .lock()
            .map_err(|_| Error::Poisoned("segment descriptor"))?;
        let updated = SegmentDescriptor::new(
            descriptor.id,
            descriptor.start_index,
            descriptor.max_segment_size,
        )
        .with_last_entry(last_index, last_position);
        self.write_descriptor(&updated)?;
        *descriptor = updated;
        Ok(())
    }

    /// Clears the recovery hint after the data it pointed to was truncated.
    pub(crate) fn reset_descriptor_hint(&self) -> Result<()> {
        let mut descriptor = self
            .descriptor
            .lock()
            .map_err(|_| Error::Poisoned("segment descriptor"))?;
        if descriptor.last_position == 0 && descriptor.last_index == 0 {
            return Ok(());
        }
        let updated = SegmentDescriptor::new(
            descriptor.id,
            descriptor.start_index,
            descriptor.max_segment_size,
        );
        self.write_descriptor(&updated)?;
        *descriptor = updated;
        Ok(())
    }

    fn write_descriptor(&self, descriptor: &SegmentDescriptor) -> Result<()> {
        self.buffer.write(0, &descriptor.encode()?)?;
        self.buffer
            .flush_range(0, DESCRIPTOR_SIZE)
            .map_err(|source| self.flush_error(source))
    }

    /// Msyncs the written part of the segment.
    ///
    /// Failures on a segment that is no longer open are logged and ignored.
    pub fn flush(&self) -> Result<()> {
        let end = self.end_position();
        match self.buffer.flush_range(0, end) {
            Ok(()) => Ok(()),
            Err(source) if self.is_open() => Err(self.flush_error(source)),
            Err(err) => {
                log::debug!("ignoring flush failure on closed segment {}: {err}", self.id);
                Ok(())
            }
        }
    }

    fn flush_error(&self, source: io::Error) -> Error {
        Error::Flush {
            segment_id: self.id,
            source,
        }
    }

    pub fn lifecycle(&self) -> SegmentLifecycle {
        self.state
            .lock()
            .map(|state| state.lifecycle)
            .unwrap_or(SegmentLifecycle::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle() == SegmentLifecycle::Open
    }

    /// Registers a reader. Returns false if the segment is no longer open.
    pub(crate) fn attach_reader(&self, reader_id: u64) -> Result<bool> {
        let mut state = self.state.lock().map_err(|_| Error::Poisoned("segment state"))?;
        if state.lifecycle != SegmentLifecycle::Open {
            return Ok(false);
        }
        state.readers.insert(reader_id);
        Ok(true)
    }

    /// Detaches a reader; the last reader of a deleted segment removes its file.
    pub(crate) fn on_reader_closed(&self, reader_id: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.readers.remove(&reader_id);
        if state.lifecycle == SegmentLifecycle::MarkedForDeletion && state.readers.is_empty() {
            if let Some(path) = state.marked_path.take() {
                remove_marked(&path);
            }
            state.lifecycle = SegmentLifecycle::Closed;
        }
    }

    /// Durably marks the segment file for deletion and removes it once no
    /// reader is attached.
    pub(crate) fn delete(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::Poisoned("segment state"))?;
        if state.lifecycle != SegmentLifecycle::Open {
            return Ok(());
        }
        let marked = file::mark_for_deletion(&self.path)?;
        if state.readers.is_empty() {
            remove_marked(&marked);
            state.lifecycle = SegmentLifecycle::Closed;
        } else {
            log::debug!(
                "deferring removal of segment {} until {} reader(s) detach",
                self.id,
                state.readers.len()
            );
            state.marked_path = Some(marked);
            state.lifecycle = SegmentLifecycle::MarkedForDeletion;
        }
        Ok(())
    }

    /// Stops accepting readers; the file stays on disk.
    pub(crate) fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.lifecycle == SegmentLifecycle::Open {
                state.lifecycle = SegmentLifecycle::Closed;
            }
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("start_index", &self.start_index)
            .field("last_index", &self.last_index())
            .field("end_position", &self.end_position())
            .field("path", &self.path)
            .finish()
    }
}

fn remove_marked(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("removed segment file {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        // The next open removes marked leftovers.
        Err(err) => log::warn!("failed to remove {}: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::SegmentLoader;
    use tempfile::tempdir;

    #[test]
    fn deletion_waits_for_attached_readers() {
        let dir = tempdir().expect("tempdir");
        let loader = SegmentLoader::for_tests(dir.path(), 4096);
        let segment = loader.create_segment(1, 1).expect("create");
        let path = segment.path().to_path_buf();
        let marked = file::deleted_path(&path);

        assert!(segment.attach_reader(7).expect("attach"));
        segment.delete().expect("delete");
        assert_eq!(segment.lifecycle(), SegmentLifecycle::MarkedForDeletion);
        assert!(!path.exists());
        assert!(marked.exists());
        assert!(!segment.attach_reader(8).expect("attach after delete"));

        segment.on_reader_closed(7);
        assert_eq!(segment.lifecycle(), SegmentLifecycle::Closed);
        assert!(!marked.exists());
    }

    #[test]
    fn deletion_without_readers_is_immediate() {
        let dir = tempdir().expect("tempdir");
        let loader = SegmentLoader::for_tests(dir.path(), 4096);
        let segment = loader.create_segment(1, 1).expect("create");
        segment.delete().expect("delete");
        assert_eq!(segment.lifecycle(), SegmentLifecycle::Closed);
        assert!(!segment.path().exists());
        assert!(!file::deleted_path(segment.path()).exists());
        segment.flush().expect("flush on closed segment is swallowed or succeeds");
    }

    #[test]
    fn descriptor_hint_round_trip() {
        let dir = tempdir().expect("tempdir");
        let loader = SegmentLoader::for_tests(dir.path(), 4096);
        let segment = loader.create_segment(3, 10).expect("create");
        segment.update_descriptor(12, 160).expect("update");
        let on_disk = SegmentDescriptor::decode(
            &fs::read(segment.path()).expect("read")[..DESCRIPTOR_SIZE],
        )
        .expect("decode");
        assert_eq!(on_disk.last_index, 12);
        assert_eq!(on_disk.last_position, 160);

        segment.reset_descriptor_hint().expect("reset");
        assert!(!segment.descriptor().expect("descriptor").has_last_entry());
    }

    #[test]
    fn reads_stop_at_published_end() {
        let dir = tempdir().expect("tempdir");
        let loader = SegmentLoader::for_tests(dir.path(), 4096);
        let segment = loader.create_segment(1, 1).expect("create");
        assert_eq!(segment.read_frame(SEGMENT_DATA_OFFSET).expect("read"), FrameRead::End);
        assert!(segment.is_empty());
        assert_eq!(segment.last_index(), 0);
    }
}
