//! The single writer of a journal.
//!
//! Appends go straight to the tail segment without taking the table lock;
//! only rotation, truncation and reset take it exclusively.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::flusher::SegmentsFlusher;
use crate::loader::SegmentLoader;
use crate::meta::JournalMetaStore;
use crate::metrics::Stopwatch;
use crate::record::JournalRecord;
use crate::segment_writer::{AppendOutcome, SegmentWriter};
use crate::segments::{JournalShared, SegmentsManager};
use crate::{frame, Error, Result};

pub struct SegmentedJournalWriter {
    shared: Arc<JournalShared>,
    segments: SegmentsManager,
    current: SegmentWriter,
    flusher: Mutex<SegmentsFlusher>,
}

impl SegmentedJournalWriter {
    pub(crate) fn open(
        shared: Arc<JournalShared>,
        loader: SegmentLoader,
        meta_store: Arc<dyn JournalMetaStore>,
    ) -> Result<Self> {
        let flusher = SegmentsFlusher::new(Arc::clone(&meta_store), Arc::clone(&shared.metrics))?;
        let mut segments = SegmentsManager::new(Arc::clone(&shared), loader, meta_store);
        let current = segments.open()?;
        Ok(Self {
            shared,
            segments,
            current,
            flusher: Mutex::new(flusher),
        })
    }

    fn flusher(&self) -> Result<MutexGuard<'_, SegmentsFlusher>> {
        self.flusher.lock().map_err(|_| Error::Poisoned("flusher"))
    }

    pub fn next_index(&self) -> i64 {
        self.current.next_index()
    }

    pub fn last_index(&self) -> i64 {
        self.current.last_index()
    }

    pub fn last_asqn(&self) -> i64 {
        self.current.last_asqn()
    }

    pub fn last_flushed_index(&self) -> Result<i64> {
        Ok(self.flusher()?.last_flushed_index())
    }

    /// Appends `data` at the next index, rolling to a new segment when the
    /// current one is full.
    pub fn append(&mut self, asqn: i64, data: &[u8]) -> Result<JournalRecord> {
        let watch = Stopwatch::start();
        let record = match self.current.append(asqn, data)? {
            AppendOutcome::Appended(record) => record,
            AppendOutcome::SegmentFull => {
                self.roll()?;
                let outcome = self.current.append(asqn, data)?;
                self.appended_after_roll(outcome, data.len())?
            }
        };
        self.observe_append(&record, watch);
        Ok(record)
    }

    /// Appends a record serialized elsewhere, typically received from a
    /// replication peer. Its index must be the next one and `checksum` must
    /// match the bytes.
    pub fn append_serialized(&mut self, checksum: u32, serialized: &[u8]) -> Result<JournalRecord> {
        let watch = Stopwatch::start();
        let record = match self.current.append_serialized(checksum, serialized)? {
            AppendOutcome::Appended(record) => record,
            AppendOutcome::SegmentFull => {
                self.roll()?;
                let outcome = self.current.append_serialized(checksum, serialized)?;
                self.appended_after_roll(outcome, serialized.len())?
            }
        };
        self.observe_append(&record, watch);
        Ok(record)
    }

    fn roll(&mut self) -> Result<()> {
        self.current = self.segments.next_segment(&self.current)?;
        Ok(())
    }

    // A fresh segment reports an oversized record as an error, so this only
    // guards against a segment that is full right after creation.
    fn appended_after_roll(&self, outcome: AppendOutcome, payload_len: usize) -> Result<JournalRecord> {
        match outcome {
            AppendOutcome::Appended(record) => Ok(record),
            AppendOutcome::SegmentFull => Err(Error::SegmentSizeTooSmall {
                segment_size: self.current.segment().max_size(),
                frame_len: frame::frame_len(payload_len),
            }),
        }
    }

    fn observe_append(&self, record: &JournalRecord, watch: Stopwatch) {
        let metrics = &self.shared.metrics;
        metrics.observe_append(record.data.len());
        metrics.observe_append_latency(watch.elapsed());
    }

    /// Discards every record after `index`. Readers positioned past it are
    /// moved back to `index + 1`.
    pub fn delete_after(&mut self, index: i64) -> Result<()> {
        let (first_index, last_index) = {
            let table = self.shared.read_segments()?;
            (table.first_index(), table.last_index())
        };
        if index >= last_index {
            return Ok(());
        }
        if index < first_index - 1 {
            return self.reset(index + 1);
        }

        // Persist the lower bound first: a crash before the truncation reaches
        // disk then leaves more records than were flushed, never fewer.
        self.flusher()?.truncated_to(index)?;
        {
            let shared = Arc::clone(&self.shared);
            let mut table = shared.write_segments()?;
            if let Some(tail) = self
                .segments
                .remove_segments_after(&mut table, &self.current, index)?
            {
                self.current = tail;
            }
            self.current.truncate(index)?;
            shared.index.delete_after(index);
            shared.readers.reseek_after(index)?;
        }
        log::debug!("truncated journal after index {index}");
        Ok(())
    }

    /// Deletes the segments that only hold records below `index`. The
    /// segment containing `index` is kept, so records before it may survive.
    pub fn delete_until(&mut self, index: i64) -> Result<bool> {
        self.segments.delete_until(index)
    }

    /// Drops every record and restarts the journal at `next_index`.
    pub fn reset(&mut self, next_index: i64) -> Result<()> {
        self.flusher()?.reset(next_index);
        self.current = self.segments.reset_segments(next_index)?;
        Ok(())
    }

    /// Forces everything appended so far to disk and records the flushed index.
    pub fn flush(&self) -> Result<()> {
        if !self.shared.is_open() {
            return Ok(());
        }
        let mut flusher = self.flusher()?;
        let table = self.shared.read_segments()?;
        flusher.flush(&table)
    }

    /// Flushes, leaves a recovery hint on the tail segment and releases the
    /// pre-created segment.
    pub(crate) fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.current.update_descriptor()?;
        self.segments.close()
    }
}

impl std::fmt::Debug for SegmentedJournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedJournalWriter")
            .field("segment", &self.current.segment().id())
            .field("next_index", &self.current.next_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SparseJournalIndex;
    use crate::meta::MemoryMetaStore;
    use crate::metrics::NoopJournalMetrics;
    use crate::record::ASQN_IGNORE;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn open(dir: &std::path::Path, meta: Arc<dyn JournalMetaStore>) -> SegmentedJournalWriter {
        try_open(dir, meta).expect("open writer")
    }

    fn try_open(dir: &std::path::Path, meta: Arc<dyn JournalMetaStore>) -> Result<SegmentedJournalWriter> {
        let shared = Arc::new(JournalShared::new(
            Arc::new(SparseJournalIndex::new(4)),
            Arc::new(NoopJournalMetrics),
        ));
        SegmentedJournalWriter::open(shared, SegmentLoader::for_tests(dir, 256), meta)
    }

    /// Meta store whose writes can be made to fail, standing in for a crash
    /// between persisting the flushed index and touching the segments.
    struct FailingMetaStore {
        inner: MemoryMetaStore,
        fail_stores: AtomicBool,
    }

    impl JournalMetaStore for FailingMetaStore {
        fn store_last_flushed_index(&self, index: i64) -> Result<()> {
            if self.fail_stores.load(Ordering::Acquire) {
                return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "meta store down")));
            }
            self.inner.store_last_flushed_index(index)
        }

        fn load_last_flushed_index(&self) -> Result<Option<i64>> {
            self.inner.load_last_flushed_index()
        }

        fn reset_last_flushed_index(&self) -> Result<()> {
            self.inner.reset_last_flushed_index()
        }
    }

    #[test]
    fn appends_roll_over_segments() {
        let dir = tempdir().expect("tempdir");
        let mut writer = open(dir.path(), Arc::new(MemoryMetaStore::new()));
        for i in 1..=12 {
            let record = writer.append(i * 10, b"payload").expect("append");
            assert_eq!(record.index, i);
        }
        let segments = writer.shared.read_segments().expect("table").len();
        assert!(segments > 1, "expected rotation, got {segments} segment(s)");
        assert_eq!(writer.last_index(), 12);
        assert_eq!(writer.last_asqn(), 120);
    }

    #[test]
    fn truncation_across_segments_then_append() {
        let dir = tempdir().expect("tempdir");
        let meta = Arc::new(MemoryMetaStore::new());
        let mut writer = open(dir.path(), meta.clone());
        for i in 1..=12 {
            writer.append(i, b"payload").expect("append");
        }
        writer.flush().expect("flush");
        assert_eq!(meta.load_last_flushed_index().expect("load"), Some(12));

        writer.delete_after(2).expect("truncate");
        assert_eq!(writer.last_index(), 2);
        assert_eq!(writer.shared.read_segments().expect("table").len(), 1);
        assert_eq!(meta.load_last_flushed_index().expect("load"), Some(2));

        let record = writer.append(3, b"again").expect("append");
        assert_eq!(record.index, 3);
        assert!(matches!(
            writer.append(2, b"stale"),
            Err(Error::InvalidAsqn { .. })
        ));
    }

    #[test]
    fn truncating_below_the_first_index_resets() {
        let dir = tempdir().expect("tempdir");
        let meta = Arc::new(MemoryMetaStore::new());
        let mut writer = open(dir.path(), meta.clone());
        for _ in 0..12 {
            writer.append(ASQN_IGNORE, b"payload").expect("append");
        }
        writer.flush().expect("flush");
        let second_start = {
            let table = writer.shared.read_segments().expect("table");
            let start = table.iter().nth(1).expect("second").start_index();
            start
        };
        assert!(writer.delete_until(second_start).expect("compact"));

        writer.delete_after(second_start - 5).expect("reset");
        assert_eq!(writer.next_index(), second_start - 4);
        assert_eq!(meta.load_last_flushed_index().expect("load"), None);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let mut writer = open(dir.path(), Arc::new(MemoryMetaStore::new()));
        let big = vec![7u8; 512];
        assert!(matches!(
            writer.append(ASQN_IGNORE, &big),
            Err(Error::SegmentSizeTooSmall { .. })
        ));
        assert_eq!(writer.last_index(), 0);
    }

    #[test]
    fn failed_truncation_never_leaves_fewer_records_than_flushed() {
        let dir = tempdir().expect("tempdir");
        let meta = Arc::new(FailingMetaStore {
            inner: MemoryMetaStore::new(),
            fail_stores: AtomicBool::new(false),
        });
        {
            let mut writer = open(dir.path(), meta.clone());
            for i in 1..=12 {
                writer.append(i, b"payload").expect("append");
            }
            writer.flush().expect("flush");
            meta.fail_stores.store(true, Ordering::Release);
            assert!(matches!(writer.delete_after(2), Err(Error::Io(_))));
            assert_eq!(writer.last_index(), 12);
            meta.fail_stores.store(false, Ordering::Release);
        }

        let writer = try_open(dir.path(), meta.clone()).expect("reopen after failed truncation");
        assert_eq!(writer.last_index(), 12);
        assert_eq!(meta.load_last_flushed_index().expect("load"), Some(12));
    }
}
