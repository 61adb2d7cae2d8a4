//! Sparse in-memory index over the journal.
//!
//! Every `density`-th index is sampled: its frame position, and its asqn when
//! the record carries one. Lookups return the greatest sample at or below the
//! key, and callers scan forward from there. The index is rebuilt from the
//! segments on open and never persisted.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::record::ASQN_IGNORE;

/// A sampled record position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexInfo {
    pub index: i64,
    pub position: usize,
}

pub trait JournalIndex: Send + Sync {
    /// Offers a record to the index; only sampled indexes are kept.
    fn index(&self, index: i64, asqn: i64, position: usize);

    /// Greatest sample with `sample.index <= index`.
    fn lookup(&self, index: i64) -> Option<IndexInfo>;

    /// Index of the greatest sampled asqn `<= asqn`.
    fn lookup_asqn(&self, asqn: i64) -> Option<i64>;

    /// Drops every sample below `index`.
    fn delete_until(&self, index: i64);

    /// Drops every sample above `index`.
    fn delete_after(&self, index: i64);

    fn clear(&self);

    fn density(&self) -> u64;
}

#[derive(Debug, Default)]
struct Samples {
    positions: BTreeMap<i64, usize>,
    asqns: BTreeMap<i64, i64>,
    index_to_asqn: BTreeMap<i64, i64>,
}

#[derive(Debug)]
pub struct SparseJournalIndex {
    density: u64,
    samples: RwLock<Samples>,
}

impl SparseJournalIndex {
    pub fn new(density: u64) -> Self {
        Self {
            density: density.max(1),
            samples: RwLock::new(Samples::default()),
        }
    }

    fn is_sampled(&self, index: i64) -> bool {
        index > 0 && (index as u64) % self.density == 0
    }

    pub fn len(&self) -> usize {
        self.samples
            .read()
            .map(|samples| samples.positions.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// A poisoned index only ever holds stale hints, so the guard is recovered
// instead of failing the caller.
macro_rules! read_samples {
    ($self:expr) => {
        $self.samples.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    };
}

macro_rules! write_samples {
    ($self:expr) => {
        $self.samples.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    };
}

impl JournalIndex for SparseJournalIndex {
    fn index(&self, index: i64, asqn: i64, position: usize) {
        if !self.is_sampled(index) {
            return;
        }
        let mut samples = write_samples!(self);
        samples.positions.insert(index, position);
        if asqn != ASQN_IGNORE {
            samples.asqns.insert(asqn, index);
            samples.index_to_asqn.insert(index, asqn);
        }
    }

    fn lookup(&self, index: i64) -> Option<IndexInfo> {
        let samples = read_samples!(self);
        samples
            .positions
            .range(..=index)
            .next_back()
            .map(|(&index, &position)| IndexInfo { index, position })
    }

    fn lookup_asqn(&self, asqn: i64) -> Option<i64> {
        let samples = read_samples!(self);
        samples.asqns.range(..=asqn).next_back().map(|(_, &index)| index)
    }

    fn delete_until(&self, index: i64) {
        let mut samples = write_samples!(self);
        let kept = samples.positions.split_off(&index);
        samples.positions = kept;
        let kept = samples.index_to_asqn.split_off(&index);
        let removed = std::mem::replace(&mut samples.index_to_asqn, kept);
        for asqn in removed.values() {
            samples.asqns.remove(asqn);
        }
    }

    fn delete_after(&self, index: i64) {
        let Some(bound) = index.checked_add(1) else {
            return;
        };
        let mut samples = write_samples!(self);
        samples.positions.retain(|&sampled, _| sampled < bound);
        let removed = samples.index_to_asqn.split_off(&bound);
        for asqn in removed.values() {
            samples.asqns.remove(asqn);
        }
    }

    fn clear(&self) {
        *write_samples!(self) = Samples::default();
    }

    fn density(&self) -> u64 {
        self.density
    }
}
