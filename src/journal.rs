//! The journal façade: one writer, any number of readers.

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::JournalConfig;
use crate::index::SparseJournalIndex;
use crate::loader::SegmentLoader;
use crate::meta::{FileMetaStore, JournalMetaStore};
use crate::metrics::{JournalMetrics, NoopJournalMetrics, Stopwatch};
use crate::reader::SegmentedJournalReader;
use crate::record::JournalRecord;
use crate::segments::JournalShared;
use crate::writer::SegmentedJournalWriter;
use crate::{Error, Result};

/// A segmented, append-only journal stored in one directory.
///
/// Writing operations take `&mut self`; readers opened with
/// [`open_reader`](Self::open_reader) can be moved to other threads and keep
/// working while the journal is appended to, truncated or compacted.
pub struct SegmentedJournal {
    config: JournalConfig,
    shared: Arc<JournalShared>,
    writer: SegmentedJournalWriter,
    closed: bool,
}

impl SegmentedJournal {
    /// Opens the journal in `config.directory`, creating it if needed. The
    /// last flushed index is kept in `{name}.meta` next to the segments.
    pub fn open(config: JournalConfig) -> Result<Self> {
        let meta_store = Arc::new(FileMetaStore::new(&config.directory, &config.name));
        Self::open_with(config, meta_store, Arc::new(NoopJournalMetrics))
    }

    pub fn open_with(
        config: JournalConfig,
        meta_store: Arc<dyn JournalMetaStore>,
        metrics: Arc<dyn JournalMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.directory)?;
        let watch = Stopwatch::start();

        let index = Arc::new(SparseJournalIndex::new(config.index_density));
        let shared = Arc::new(JournalShared::new(index, Arc::clone(&metrics)));
        let loader = SegmentLoader::new(&config, Arc::clone(&metrics));
        let writer = SegmentedJournalWriter::open(Arc::clone(&shared), loader, meta_store)?;

        metrics.observe_journal_open(watch.elapsed());
        Ok(Self {
            config,
            shared,
            writer,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Appends `data` at the next index. `asqn` is the caller's own sequence
    /// number; it must increase strictly unless it is [`ASQN_IGNORE`](crate::ASQN_IGNORE).
    pub fn append(&mut self, asqn: i64, data: &[u8]) -> Result<JournalRecord> {
        self.ensure_open()?;
        self.writer.append(asqn, data)
    }

    /// Appends a record in its serialized form after verifying `checksum`.
    pub fn append_serialized(&mut self, checksum: u32, serialized: &[u8]) -> Result<JournalRecord> {
        self.ensure_open()?;
        self.writer.append_serialized(checksum, serialized)
    }

    /// Appends a record read from another journal, keeping its index, asqn
    /// and checksum.
    pub fn append_record(&mut self, record: &JournalRecord) -> Result<JournalRecord> {
        self.append_serialized(record.checksum, &record.serialized())
    }

    pub fn delete_after(&mut self, index: i64) -> Result<()> {
        self.ensure_open()?;
        self.writer.delete_after(index)
    }

    /// Compacts the journal up to the segment holding `index`. Returns
    /// whether any segment was deleted.
    pub fn delete_until(&mut self, index: i64) -> Result<bool> {
        self.ensure_open()?;
        self.writer.delete_until(index)
    }

    pub fn reset(&mut self, next_index: i64) -> Result<()> {
        self.ensure_open()?;
        self.writer.reset(next_index)
    }

    /// Forces appended records to disk. A closed journal was flushed when it
    /// closed, so this is a no-op there.
    pub fn flush(&self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.writer.flush()
    }

    /// Opens a reader positioned at the first index.
    pub fn open_reader(&self) -> Result<SegmentedJournalReader> {
        self.ensure_open()?;
        SegmentedJournalReader::open(Arc::clone(&self.shared))
    }

    pub fn first_index(&self) -> i64 {
        match self.shared.segments.read() {
            Ok(table) => table.first_index(),
            Err(poisoned) => poisoned.into_inner().first_index(),
        }
    }

    pub fn last_index(&self) -> i64 {
        self.writer.last_index()
    }

    pub fn last_asqn(&self) -> i64 {
        self.writer.last_asqn()
    }

    pub fn last_flushed_index(&self) -> Result<i64> {
        self.writer.last_flushed_index()
    }

    pub fn is_empty(&self) -> bool {
        self.last_index() < self.first_index()
    }

    pub fn segment_count(&self) -> usize {
        match self.shared.segments.read() {
            Ok(table) => table.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn reader_count(&self) -> usize {
        self.shared.readers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Flushes and closes the journal. Open readers fail with
    /// [`Error::Closed`] from then on; segments they still map are released
    /// when they are dropped.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let flushed = self.writer.close();

        self.shared.open.store(false, Ordering::Release);
        let segments = self.shared.write_segments()?.take_all();
        for segment in segments {
            segment.close();
        }
        log::info!("closed journal {}", self.config.name);
        flushed
    }
}

impl Drop for SegmentedJournal {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("failed to close journal {}: {err}", self.config.name);
        }
    }
}

impl std::fmt::Debug for SegmentedJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedJournal")
            .field("directory", &self.config.directory)
            .field("name", &self.config.name)
            .field("writer", &self.writer)
            .field("closed", &self.closed)
            .finish()
    }
}
