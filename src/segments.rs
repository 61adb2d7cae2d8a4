//! The ordered set of segments and everything that changes its shape.
//!
//! # Design
//!
//! The segment table lives behind one `RwLock` shared with readers. Readers
//! and flushes take it shared; rotation, compaction, truncation and reset take
//! it exclusively. The manager itself is owned by the single writer.
//!
//! The next segment file is created on a background thread while the current
//! one fills up, so rotation only has to write a descriptor. The thread is
//! always joined; if it failed, the segment is created synchronously.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

use crate::file;
use crate::index::JournalIndex;
use crate::loader::{LoadedSegment, SegmentLoader, UninitializedSegment};
use crate::meta::JournalMetaStore;
use crate::metrics::{JournalMetrics, Stopwatch};
use crate::reader::ReaderRegistry;
use crate::record::ASQN_IGNORE;
use crate::segment::Segment;
use crate::segment_writer::SegmentWriter;
use crate::{Error, Result};

/// Live segments keyed by start index.
#[derive(Debug, Default)]
pub struct SegmentTable {
    segments: BTreeMap<i64, Arc<Segment>>,
}

impl SegmentTable {
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn first(&self) -> Option<&Arc<Segment>> {
        self.segments.values().next()
    }

    pub fn last(&self) -> Option<&Arc<Segment>> {
        self.segments.values().next_back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<Segment>> {
        self.segments.values()
    }

    /// First index of the journal, whether or not that record exists yet.
    pub fn first_index(&self) -> i64 {
        self.first().map_or(1, |segment| segment.start_index())
    }

    pub fn last_index(&self) -> i64 {
        self.last()
            .map_or(self.first_index() - 1, |segment| segment.last_index())
    }

    /// The segment whose range would contain `index`.
    pub fn segment_for(&self, index: i64) -> Option<&Arc<Segment>> {
        self.segments
            .range(..=index)
            .next_back()
            .map(|(_, segment)| segment)
            .or_else(|| self.first())
    }

    /// The segment following the one starting at `start_index`.
    pub fn next_after(&self, start_index: i64) -> Option<&Arc<Segment>> {
        let from = start_index.checked_add(1)?;
        self.segments.range(from..).next().map(|(_, segment)| segment)
    }

    /// The segment preceding the one starting at `start_index`.
    pub fn previous_before(&self, start_index: i64) -> Option<&Arc<Segment>> {
        self.segments
            .range(..start_index)
            .next_back()
            .map(|(_, segment)| segment)
    }

    /// Segments whose records may include `index` or anything after it.
    pub fn from_index(&self, index: i64) -> impl Iterator<Item = &Arc<Segment>> {
        let start = self
            .segments
            .range(..=index)
            .next_back()
            .map_or(i64::MIN, |(start, _)| *start);
        self.segments.range(start..).map(|(_, segment)| segment)
    }

    pub(crate) fn insert(&mut self, segment: Arc<Segment>) {
        self.segments.insert(segment.start_index(), segment);
    }

    pub(crate) fn remove(&mut self, start_index: i64) -> Option<Arc<Segment>> {
        self.segments.remove(&start_index)
    }

    pub(crate) fn take_all(&mut self) -> Vec<Arc<Segment>> {
        std::mem::take(&mut self.segments).into_values().collect()
    }
}

/// State shared by the journal, its writer and every reader.
pub(crate) struct JournalShared {
    pub(crate) segments: RwLock<SegmentTable>,
    pub(crate) index: Arc<dyn JournalIndex>,
    pub(crate) readers: ReaderRegistry,
    pub(crate) metrics: Arc<dyn JournalMetrics>,
    pub(crate) open: AtomicBool,
}

impl JournalShared {
    pub(crate) fn new(index: Arc<dyn JournalIndex>, metrics: Arc<dyn JournalMetrics>) -> Self {
        Self {
            segments: RwLock::new(SegmentTable::default()),
            index,
            readers: ReaderRegistry::default(),
            metrics,
            open: AtomicBool::new(true),
        }
    }

    pub(crate) fn read_segments(&self) -> Result<RwLockReadGuard<'_, SegmentTable>> {
        self.segments.read().map_err(|_| Error::Poisoned("segment table"))
    }

    pub(crate) fn write_segments(&self) -> Result<RwLockWriteGuard<'_, SegmentTable>> {
        self.segments.write().map_err(|_| Error::Poisoned("segment table"))
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(std::sync::atomic::Ordering::Acquire)
    }
}

type PendingSegment = JoinHandle<Result<UninitializedSegment>>;

pub struct SegmentsManager {
    shared: Arc<JournalShared>,
    loader: SegmentLoader,
    meta_store: Arc<dyn JournalMetaStore>,
    next_segment_id: u64,
    pending: Option<PendingSegment>,
}

impl SegmentsManager {
    pub(crate) fn new(
        shared: Arc<JournalShared>,
        loader: SegmentLoader,
        meta_store: Arc<dyn JournalMetaStore>,
    ) -> Self {
        Self {
            shared,
            loader,
            meta_store,
            next_segment_id: 1,
            pending: None,
        }
    }

    pub fn loader(&self) -> &SegmentLoader {
        &self.loader
    }

    // ------------------------------------------------------------------------
    // Load on open
    // ------------------------------------------------------------------------

    /// Loads the segments on disk, healing or rejecting corruption, and
    /// returns the writer of the tail segment.
    pub(crate) fn open(&mut self) -> Result<SegmentWriter> {
        let dir = self.loader.directory().to_path_buf();
        let name = self.loader.name().to_string();
        let removed = file::remove_deleted_segments(&dir, &name)?;
        if removed > 0 {
            log::info!("removed {removed} segment(s) left marked for deletion");
        }

        let ids = file::discover_segments(&dir, &name)?;
        self.next_segment_id = ids.last().map_or(1, |id| id + 1);
        let flushed = self.meta_store.load_last_flushed_index()?;

        let shared = Arc::clone(&self.shared);
        let mut tail: Option<SegmentWriter> = None;
        // Uninitialized files are pre-created leftovers only when nothing
        // initialized follows them.
        let mut first_leftover: Option<usize> = None;
        let mut table = shared.write_segments()?;
        for (position, &id) in ids.iter().enumerate() {
            let previous = tail.as_ref().map(|writer| Arc::clone(writer.segment()));
            let at = first_leftover.unwrap_or(position);
            let recovered = match self.loader.load_segment(id) {
                Ok(LoadedSegment::Uninitialized(_)) => {
                    first_leftover.get_or_insert(position);
                    continue;
                }
                Ok(LoadedSegment::Initialized(_)) if at < position => Err(Error::corrupted(format!(
                    "segment {} is uninitialized but segment {id} after it holds data",
                    ids[at]
                ))),
                Ok(LoadedSegment::Initialized(segment)) => {
                    self.recover_segment(segment, previous.as_deref())
                }
                Err(err) => Err(err),
            };
            match recovered {
                Ok(writer) => {
                    table.insert(Arc::clone(writer.segment()));
                    tail = Some(writer);
                }
                Err(err) if err.is_corruption() => {
                    let damaged = ids[at];
                    let expected_start = previous
                        .as_ref()
                        .map_or(i64::MIN, |segment| segment.last_index() + 1);
                    if let Some(flushed) = flushed {
                        if flushed >= expected_start {
                            return Err(Error::corrupted(format!(
                                "segment {damaged} is corrupted and holds flushed data (last flushed index {flushed}): {err}"
                            )));
                        }
                    }
                    log::warn!(
                        "segment {damaged} is corrupted and holds no flushed data, discarding it and {} later segment(s): {err}",
                        ids.len() - at - 1
                    );
                    self.discard_files(&ids[at..])?;
                    first_leftover = None;
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        let writer = match tail {
            Some(writer) => writer,
            None => {
                let id = self.allocate_id();
                let segment = self.loader.create_segment(id, 1)?;
                table.insert(Arc::clone(&segment));
                SegmentWriter::open(segment, Arc::clone(&self.shared.index), ASQN_IGNORE)?
            }
        };

        if let Some(flushed) = flushed {
            if writer.last_index() < flushed {
                return Err(Error::corrupted(format!(
                    "journal ends at index {} but index {flushed} was flushed",
                    writer.last_index()
                )));
            }
        }
        if let Some(at) = first_leftover {
            self.remove_leftovers(&ids[at..])?;
        }
        self.shared.metrics.set_segment_count(table.len());
        log::info!(
            "opened journal {} with {} segment(s), indexes [{}, {}]",
            name,
            table.len(),
            table.first_index(),
            table.last_index()
        );
        drop(table);

        self.schedule_pre_creation();
        Ok(writer)
    }

    /// Checks that `segment` continues `previous` and recovers its write
    /// position.
    fn recover_segment(
        &self,
        segment: Arc<Segment>,
        previous: Option<&Segment>,
    ) -> Result<SegmentWriter> {
        let id = segment.id();
        let asqn_floor = previous.map_or(ASQN_IGNORE, |segment| segment.last_asqn());
        if let Some(previous) = previous {
            let expected = previous.last_index() + 1;
            if segment.start_index() != expected {
                return Err(Error::corrupted(format!(
                    "gap between segment {} (last index {}) and segment {id} (start index {})",
                    previous.id(),
                    previous.last_index(),
                    segment.start_index()
                )));
            }
        }
        let writer = SegmentWriter::open(segment, Arc::clone(&self.shared.index), asqn_floor)?;
        log::debug!(
            "loaded segment {id} with indexes [{}, {}]",
            writer.segment().start_index(),
            writer.last_index()
        );
        Ok(writer)
    }

    fn remove_leftovers(&self, ids: &[u64]) -> Result<()> {
        for &id in ids {
            let path = self.loader.segment_path(id);
            log::info!("removing uninitialized segment {}", path.display());
            std::fs::remove_file(&path)?;
        }
        file::sync_directory(self.loader.directory())?;
        Ok(())
    }

    fn discard_files(&self, ids: &[u64]) -> Result<()> {
        for &id in ids.iter().rev() {
            let path = self.loader.segment_path(id);
            let marked = file::mark_for_deletion(&path)?;
            std::fs::remove_file(&marked)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Segment creation
    // ------------------------------------------------------------------------

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }

    fn schedule_pre_creation(&mut self) {
        if self.pending.is_some() {
            return;
        }
        let id = self.allocate_id();
        let loader = self.loader.clone();
        let spawned = thread::Builder::new()
            .name("journal-segment-alloc".to_string())
            .spawn(move || loader.create_uninitialized(id));
        match spawned {
            Ok(handle) => self.pending = Some(handle),
            Err(err) => log::warn!("failed to spawn segment pre-creation for id {id}: {err}"),
        }
    }

    /// Joins the background pre-creation, if any.
    fn take_pending(&mut self) -> Option<UninitializedSegment> {
        let handle = self.pending.take()?;
        match handle.join() {
            Ok(Ok(segment)) => Some(segment),
            Ok(Err(err)) => {
                log::warn!("background segment creation failed, creating synchronously: {err}");
                None
            }
            Err(_) => {
                log::warn!("background segment creation panicked, creating synchronously");
                None
            }
        }
    }

    fn create_segment(&mut self, start_index: i64) -> Result<Arc<Segment>> {
        let watch = Stopwatch::start();
        let segment = match self.take_pending() {
            Some(pending) => self.loader.initialize(pending, start_index)?,
            None => {
                let id = self.allocate_id();
                self.loader.create_uninitialized(id).and_then(|pending| {
                    self.loader.initialize(pending, start_index)
                })?
            }
        };
        self.shared.metrics.observe_segment_creation(watch.elapsed());
        Ok(segment)
    }

    // ------------------------------------------------------------------------
    // Shape changes
    // ------------------------------------------------------------------------

    /// Seals `current` and returns the writer of the segment that follows it.
    pub(crate) fn next_segment(&mut self, current: &SegmentWriter) -> Result<SegmentWriter> {
        current.segment().flush()?;
        current.update_descriptor()?;

        let start_index = current.last_index() + 1;
        let segment = self.create_segment(start_index)?;
        {
            let mut table = self.shared.write_segments()?;
            table.insert(Arc::clone(&segment));
            self.shared.metrics.set_segment_count(table.len());
        }
        log::debug!(
            "rolled from segment {} to segment {} at index {start_index}",
            current.segment().id(),
            segment.id()
        );
        self.schedule_pre_creation();
        SegmentWriter::open(segment, Arc::clone(&self.shared.index), current.last_asqn())
    }

    /// Deletes every segment older than the one that contains `index`.
    pub(crate) fn delete_until(&mut self, index: i64) -> Result<bool> {
        let mut table = self.shared.write_segments()?;
        let Some(keep_from) = table.segment_for(index).map(|segment| segment.start_index()) else {
            return Ok(false);
        };
        let older: Vec<i64> = table
            .iter()
            .map(|segment| segment.start_index())
            .take_while(|start| *start < keep_from)
            .collect();
        if older.is_empty() {
            return Ok(false);
        }
        for start in older {
            if let Some(segment) = table.remove(start) {
                log::debug!("compacting segment {} (start index {start})", segment.id());
                segment.delete()?;
            }
        }
        self.shared.index.delete_until(keep_from);
        self.shared.metrics.set_segment_count(table.len());
        Ok(true)
    }

    /// Removes every segment starting after `index`. Returns a writer over
    /// the new tail when `current` was removed; the caller truncates it.
    pub(crate) fn remove_segments_after(
        &self,
        table: &mut SegmentTable,
        current: &SegmentWriter,
        index: i64,
    ) -> Result<Option<SegmentWriter>> {
        let mut current_removed = false;
        while table.len() > 1 {
            let Some(tail) = table.last().cloned() else {
                break;
            };
            if tail.start_index() <= index {
                break;
            }
            self.remove_segment(table, &tail)?;
            current_removed |= current.segment().id() == tail.id();
        }
        if !current_removed {
            return Ok(None);
        }
        let tail = table
            .last()
            .cloned()
            .ok_or_else(|| Error::corrupted("no segment left after truncation"))?;
        let asqn_floor = table
            .previous_before(tail.start_index())
            .map_or(ASQN_IGNORE, |segment| segment.last_asqn());
        Ok(Some(SegmentWriter::resume(
            tail,
            Arc::clone(&self.shared.index),
            asqn_floor,
        )))
    }

    /// Deletes one segment and drops it from the table.
    pub(crate) fn remove_segment(&self, table: &mut SegmentTable, segment: &Arc<Segment>) -> Result<()> {
        table.remove(segment.start_index());
        segment.delete()?;
        self.shared.metrics.set_segment_count(table.len());
        log::debug!("removed segment {} (start index {})", segment.id(), segment.start_index());
        Ok(())
    }

    /// Replaces every segment with a single empty one starting at `index`
    /// and sends every reader there.
    pub(crate) fn reset_segments(&mut self, index: i64) -> Result<SegmentWriter> {
        self.meta_store.reset_last_flushed_index()?;
        let pending = self.take_pending();

        let shared = Arc::clone(&self.shared);
        let mut table = shared.write_segments()?;
        for segment in table.take_all().into_iter().rev() {
            segment.delete()?;
        }
        self.shared.index.clear();

        let segment = match pending {
            Some(pending) => self.loader.initialize(pending, index)?,
            None => {
                let id = self.allocate_id();
                self.loader.create_segment(id, index)?
            }
        };
        table.insert(Arc::clone(&segment));
        self.shared.readers.reseek_all(index)?;
        self.shared.metrics.set_segment_count(table.len());
        drop(table);

        log::info!("reset journal to start at index {index}");
        self.schedule_pre_creation();
        SegmentWriter::open(segment, Arc::clone(&self.shared.index), ASQN_IGNORE)
    }

    /// Joins the background pre-creation and removes its file.
    pub(crate) fn close(&mut self) -> Result<()> {
        if let Some(pending) = self.take_pending() {
            pending.discard()?;
        }
        Ok(())
    }
}

impl Drop for SegmentsManager {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("failed to release pre-created segment: {err}");
        }
    }
}
