//! Journal configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::descriptor::DESCRIPTOR_SIZE;
use crate::frame::MIN_FRAME_LEN;
use crate::{Error, Result};

/// Default segment size (128 MB)
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 128 * 1024 * 1024;

/// Default number of records between sparse index entries.
pub const DEFAULT_INDEX_DENSITY: u64 = 100;

/// Configuration for a [`SegmentedJournal`](crate::SegmentedJournal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Directory holding the segment files and the meta file.
    pub directory: PathBuf,

    /// Prefix of every file the journal creates.
    /// Default: "journal"
    pub name: String,

    /// Size of each segment file in bytes, descriptor included.
    /// Default: 128 MB
    pub max_segment_size: usize,

    /// Number of records between sparse index entries.
    /// Default: 100
    pub index_density: u64,

    /// Reserve disk blocks when a segment file is created.
    /// Default: true
    pub preallocate_segment_files: bool,

    /// Free space that must remain after a new segment is created.
    /// Default: 0
    pub min_free_disk_space: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            name: "journal".to_string(),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            index_density: DEFAULT_INDEX_DENSITY,
            preallocate_segment_files: true,
            min_free_disk_space: 0,
        }
    }
}

impl JournalConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file; missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes).map_err(std::io::Error::from)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("journal name must not be empty"));
        }
        if self.name.contains(std::path::is_separator) {
            return Err(Error::InvalidConfig("journal name must not contain a path separator"));
        }
        if self.max_segment_size < DESCRIPTOR_SIZE + MIN_FRAME_LEN {
            return Err(Error::SegmentSizeTooSmall {
                segment_size: self.max_segment_size,
                frame_len: MIN_FRAME_LEN,
            });
        }
        if u32::try_from(self.max_segment_size).is_err() {
            return Err(Error::InvalidConfig("max segment size must fit in 32 bits"));
        }
        if self.index_density == 0 {
            return Err(Error::InvalidConfig("index density must be positive"));
        }
        Ok(())
    }
}
