//! Segmented, memory-mapped, append-only journal.
//!
//! Records are appended with a contiguous 1-based index and an optional
//! application sequence number (asqn). The journal is split into fixed-size
//! segment files that are rotated, compacted from the head and truncated from
//! the tail; readers walk it concurrently with the single writer.
//!
//! ```no_run
//! use journal::{JournalConfig, JournalReader, SegmentedJournal, ASQN_IGNORE};
//!
//! # fn main() -> journal::Result<()> {
//! let mut journal = SegmentedJournal::open(JournalConfig::new("/tmp/journal"))?;
//! journal.append(ASQN_IGNORE, b"hello")?;
//! journal.flush()?;
//!
//! let mut reader = journal.open_reader()?;
//! while let Some(record) = reader.next()? {
//!     println!("{} {:?}", record.index, record.data);
//! }
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod file;
pub mod flusher;
pub mod frame;
pub mod index;
pub mod inspect;
pub mod journal;
pub mod loader;
pub mod meta;
pub mod metrics;
pub mod mmap;
pub mod reader;
pub mod record;
pub mod segment;
pub mod segment_reader;
pub mod segment_writer;
pub mod segments;
pub mod writer;

pub use config::JournalConfig;
pub use descriptor::SegmentDescriptor;
pub use error::{Error, Result};
pub use index::{IndexInfo, JournalIndex, SparseJournalIndex};
pub use inspect::{inspect_journal, read_records, SegmentSummary, SegmentTail};
pub use journal::SegmentedJournal;
pub use meta::{FileMetaStore, JournalMetaStore, MemoryMetaStore};
pub use metrics::{JournalMetrics, NoopJournalMetrics};
pub use reader::{JournalReader, SegmentedJournalReader};
pub use record::{JournalRecord, ASQN_IGNORE};
pub use writer::SegmentedJournalWriter;
