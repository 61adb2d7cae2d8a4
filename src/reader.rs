//! Readers over the whole journal.
//!
//! A reader walks segment after segment under the journal's shared lock. When
//! the writer truncates or resets the journal it cannot touch readers
//! directly, so it leaves a reseek request in each affected reader's handle;
//! the reader applies it on its next operation, before reading anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLockReadGuard};

use crate::metrics::Stopwatch;
use crate::record::{JournalRecord, ASQN_IGNORE};
use crate::segment::SEGMENT_DATA_OFFSET;
use crate::segment_reader::SegmentReader;
use crate::segments::{JournalShared, SegmentTable};
use crate::{Error, Result};

const NO_RESEEK: i64 = i64::MIN;

/// Cursor over the journal's records.
pub trait JournalReader {
    /// Whether `next` would return a record right now.
    fn has_next(&mut self) -> Result<bool>;

    /// The next record, or `None` when the reader is caught up.
    fn next(&mut self) -> Result<Option<JournalRecord>>;

    /// Positions the reader so that `next` returns `index`. Indexes outside
    /// the journal are clamped to its first index or to one past its last.
    /// Returns the index `next` will return.
    fn seek(&mut self, index: i64) -> Result<i64>;

    fn seek_to_first(&mut self) -> Result<i64>;

    /// Positions the reader on the last record.
    fn seek_to_last(&mut self) -> Result<i64>;

    /// Positions the reader on the last record whose asqn is at most `asqn`,
    /// or on the first record if there is none.
    fn seek_to_asqn(&mut self, asqn: i64) -> Result<i64> {
        self.seek_to_asqn_with_bound(asqn, i64::MAX)
    }

    /// Like [`seek_to_asqn`](Self::seek_to_asqn), ignoring records after
    /// `upper_index`.
    fn seek_to_asqn_with_bound(&mut self, asqn: i64, upper_index: i64) -> Result<i64>;

    /// Index of the record `next` would return.
    fn next_index(&self) -> i64;
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug)]
pub(crate) struct ReaderHandle {
    next_index: AtomicI64,
    reseek: AtomicI64,
}

impl ReaderHandle {
    fn new(next_index: i64) -> Self {
        Self {
            next_index: AtomicI64::new(next_index),
            reseek: AtomicI64::new(NO_RESEEK),
        }
    }
}

/// Live readers, keyed by reader id.
#[derive(Debug, Default)]
pub(crate) struct ReaderRegistry {
    next_id: AtomicU64,
    readers: Mutex<HashMap<u64, Arc<ReaderHandle>>>,
}

impl ReaderRegistry {
    fn register(&self, next_index: i64) -> Result<(u64, Arc<ReaderHandle>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(ReaderHandle::new(next_index));
        self.readers
            .lock()
            .map_err(|_| Error::Poisoned("reader registry"))?
            .insert(id, Arc::clone(&handle));
        Ok((id, handle))
    }

    fn unregister(&self, id: u64) {
        if let Ok(mut readers) = self.readers.lock() {
            readers.remove(&id);
        }
    }

    /// Asks every reader positioned past `index` to move back to `index + 1`.
    pub(crate) fn reseek_after(&self, index: i64) -> Result<()> {
        let readers = self
            .readers
            .lock()
            .map_err(|_| Error::Poisoned("reader registry"))?;
        for handle in readers.values() {
            if handle.next_index.load(Ordering::Acquire) > index {
                handle.reseek.store(index + 1, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Asks every reader to move to `index`.
    pub(crate) fn reseek_all(&self, index: i64) -> Result<()> {
        let readers = self
            .readers
            .lock()
            .map_err(|_| Error::Poisoned("reader registry"))?;
        for handle in readers.values() {
            handle.reseek.store(index, Ordering::Release);
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.readers.lock().map(|readers| readers.len()).unwrap_or(0)
    }
}

// ============================================================================
// Reader
// ============================================================================

pub struct SegmentedJournalReader {
    shared: Arc<JournalShared>,
    id: u64,
    handle: Arc<ReaderHandle>,
    current: SegmentReader,
}

impl SegmentedJournalReader {
    pub(crate) fn open(shared: Arc<JournalShared>) -> Result<Self> {
        let (id, handle, current) = {
            let table = read_table(&shared)?;
            let first = table.first().cloned().ok_or(Error::Closed)?;
            let (id, handle) = shared.readers.register(first.start_index())?;
            first.attach_reader(id)?;
            (id, handle, SegmentReader::new(first))
        };
        Ok(Self {
            shared,
            id,
            handle,
            current,
        })
    }

    fn apply_reseek(&mut self, table: &SegmentTable) -> Result<()> {
        let target = self.handle.reseek.swap(NO_RESEEK, Ordering::AcqRel);
        if target != NO_RESEEK {
            self.seek_locked(table, target)?;
        }
        Ok(())
    }

    fn switch_to(&mut self, reader: SegmentReader) -> Result<()> {
        let previous = self.current.segment();
        if reader.segment().id() != previous.id() {
            reader.segment().attach_reader(self.id)?;
            previous.on_reader_closed(self.id);
        }
        self.current = reader;
        self.handle
            .next_index
            .store(self.current.next_index(), Ordering::Release);
        Ok(())
    }

    fn seek_locked(&mut self, table: &SegmentTable, index: i64) -> Result<i64> {
        let watch = Stopwatch::start();
        let target = index.max(table.first_index()).min(table.last_index() + 1);
        let segment = table.segment_for(target).cloned().ok_or(Error::Closed)?;

        let journal_index = Arc::clone(&self.shared.index);
        let mut reader = match journal_index.lookup(target) {
            Some(hint)
                if hint.index >= segment.start_index() && hint.position >= SEGMENT_DATA_OFFSET =>
            {
                SegmentReader::at(segment, hint.position, hint.index)
            }
            _ => SegmentReader::new(segment),
        };
        let record_visited = (target - reader.next_index()).max(0) as u64 > journal_index.density();
        reader.skip_to(target, |index, asqn, position| {
            if record_visited {
                journal_index.index(index, asqn, position);
            }
        })?;

        self.switch_to(reader)?;
        self.shared.metrics.observe_seek_latency(watch.elapsed());
        Ok(self.current.next_index())
    }

    fn next_locked(&mut self, table: &SegmentTable) -> Result<Option<JournalRecord>> {
        loop {
            if let Some(record) = self.current.next()? {
                self.handle
                    .next_index
                    .store(record.index + 1, Ordering::Release);
                return Ok(Some(record));
            }
            let Some(next) = table.next_after(self.current.segment().start_index()) else {
                return Ok(None);
            };
            if next.start_index() != self.current.next_index() {
                return Err(Error::corrupted(format!(
                    "segment {} starts at index {}, expected {}",
                    next.id(),
                    next.start_index(),
                    self.current.next_index()
                )));
            }
            let reader = SegmentReader::new(Arc::clone(next));
            self.switch_to(reader)?;
        }
    }
}

fn read_table(shared: &JournalShared) -> Result<RwLockReadGuard<'_, SegmentTable>> {
    if !shared.is_open() {
        return Err(Error::Closed);
    }
    shared.read_segments()
}

impl JournalReader for SegmentedJournalReader {
    fn has_next(&mut self) -> Result<bool> {
        let shared = Arc::clone(&self.shared);
        let table = read_table(&shared)?;
        self.apply_reseek(&table)?;
        if self.current.has_next() {
            return Ok(true);
        }
        Ok(table
            .next_after(self.current.segment().start_index())
            .is_some_and(|segment| !segment.is_empty()))
    }

    fn next(&mut self) -> Result<Option<JournalRecord>> {
        let shared = Arc::clone(&self.shared);
        let table = read_table(&shared)?;
        self.apply_reseek(&table)?;
        self.next_locked(&table)
    }

    fn seek(&mut self, index: i64) -> Result<i64> {
        let shared = Arc::clone(&self.shared);
        let table = read_table(&shared)?;
        self.handle.reseek.store(NO_RESEEK, Ordering::Release);
        self.seek_locked(&table, index)
    }

    fn seek_to_first(&mut self) -> Result<i64> {
        self.seek(i64::MIN)
    }

    fn seek_to_last(&mut self) -> Result<i64> {
        let shared = Arc::clone(&self.shared);
        let table = read_table(&shared)?;
        self.handle.reseek.store(NO_RESEEK, Ordering::Release);
        let last = table.last_index();
        self.seek_locked(&table, last)
    }

    fn seek_to_asqn_with_bound(&mut self, asqn: i64, upper_index: i64) -> Result<i64> {
        let shared = Arc::clone(&self.shared);
        let table = read_table(&shared)?;
        self.handle.reseek.store(NO_RESEEK, Ordering::Release);

        let first = table.first_index();
        let start = shared
            .index
            .lookup_asqn(asqn)
            .filter(|index| *index >= first && *index <= upper_index)
            .unwrap_or(first);
        self.seek_locked(&table, start)?;

        let mut found = None;
        while let Some(record) = self.next_locked(&table)? {
            if record.index > upper_index {
                break;
            }
            if record.asqn == ASQN_IGNORE {
                continue;
            }
            if record.asqn > asqn {
                break;
            }
            found = Some(record.index);
        }
        self.seek_locked(&table, found.unwrap_or(first))
    }

    fn next_index(&self) -> i64 {
        match self.handle.reseek.load(Ordering::Acquire) {
            NO_RESEEK => self.current.next_index(),
            target => target,
        }
    }
}

impl Drop for SegmentedJournalReader {
    fn drop(&mut self) {
        self.current.segment().on_reader_closed(self.id);
        self.shared.readers.unregister(self.id);
    }
}

impl std::fmt::Debug for SegmentedJournalReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedJournalReader")
            .field("id", &self.id)
            .field("segment", &self.current.segment().id())
            .field("next_index", &self.current.next_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reseeks_only_readers_past_the_cut() {
        let registry = ReaderRegistry::default();
        let (_behind_id, behind) = registry.register(3).expect("register");
        let (ahead_id, ahead) = registry.register(9).expect("register");
        assert_eq!(registry.len(), 2);

        registry.reseek_after(5).expect("reseek");
        assert_eq!(behind.reseek.load(Ordering::Acquire), NO_RESEEK);
        assert_eq!(ahead.reseek.load(Ordering::Acquire), 6);

        registry.reseek_all(100).expect("reseek all");
        assert_eq!(behind.reseek.load(Ordering::Acquire), 100);

        registry.unregister(ahead_id);
        assert_eq!(registry.len(), 1);
    }
}
