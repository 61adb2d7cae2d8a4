//! Makes appended records durable and remembers how far that got.

use std::sync::Arc;

use crate::meta::JournalMetaStore;
use crate::metrics::{JournalMetrics, Stopwatch};
use crate::segments::SegmentTable;
use crate::Result;

pub struct SegmentsFlusher {
    meta_store: Arc<dyn JournalMetaStore>,
    metrics: Arc<dyn JournalMetrics>,
    last_flushed_index: i64,
}

impl SegmentsFlusher {
    pub(crate) fn new(
        meta_store: Arc<dyn JournalMetaStore>,
        metrics: Arc<dyn JournalMetrics>,
    ) -> Result<Self> {
        let last_flushed_index = meta_store.load_last_flushed_index()?.unwrap_or(0);
        Ok(Self {
            meta_store,
            metrics,
            last_flushed_index,
        })
    }

    pub fn last_flushed_index(&self) -> i64 {
        self.last_flushed_index
    }

    /// Flushes every segment written since the previous flush, then persists
    /// the new last flushed index.
    pub(crate) fn flush(&mut self, segments: &SegmentTable) -> Result<()> {
        let Some(tail) = segments.last() else {
            return Ok(());
        };
        let last_index = tail.last_index();
        if last_index <= self.last_flushed_index {
            return Ok(());
        }
        let watch = Stopwatch::start();
        for segment in segments.from_index(self.last_flushed_index + 1) {
            segment.flush()?;
        }
        self.meta_store.store_last_flushed_index(last_index)?;
        self.last_flushed_index = last_index;
        self.metrics.observe_segment_flush(watch.elapsed());
        log::trace!("flushed journal up to index {last_index}");
        Ok(())
    }

    /// Lowers the persisted index after the records above `index` were discarded.
    pub(crate) fn truncated_to(&mut self, index: i64) -> Result<()> {
        if self.last_flushed_index > index {
            self.meta_store.store_last_flushed_index(index)?;
            self.last_flushed_index = index;
        }
        Ok(())
    }

    /// Forgets the persisted index; called before the journal is reset.
    pub(crate) fn reset(&mut self, next_index: i64) {
        self.last_flushed_index = next_index - 1;
    }
}
