//! Creation and loading of segment files.
//!
//! New segments are created in two steps so the expensive part (allocation
//! and mapping) can run ahead of time on a background thread: an
//! [`UninitializedSegment`] has its file sized and mapped but its descriptor
//! left zeroed, and is turned into a [`Segment`] once its start index is known.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::allocator::{available_disk_space, SegmentAllocator};
use crate::config::JournalConfig;
use crate::descriptor::{SegmentDescriptor, DESCRIPTOR_SIZE, VERSION_UNINITIALIZED};
use crate::file;
use crate::metrics::{JournalMetrics, Stopwatch};
use crate::mmap::MappedBuffer;
use crate::segment::Segment;
use crate::{Error, Result};

/// A segment file that is allocated and mapped but has no descriptor yet.
pub struct UninitializedSegment {
    id: u64,
    path: PathBuf,
    buffer: MappedBuffer,
}

impl UninitializedSegment {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the file of a segment that will never be used.
    pub fn discard(self) -> Result<()> {
        let path = self.path;
        drop(self.buffer);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(dir) = path.parent() {
            file::sync_directory(dir)?;
        }
        log::debug!("discarded pre-created segment {}", path.display());
        Ok(())
    }
}

/// Outcome of loading an existing segment file.
pub enum LoadedSegment {
    Initialized(Arc<Segment>),
    /// Left behind by an interrupted pre-creation; safe to delete.
    Uninitialized(PathBuf),
}

#[derive(Clone)]
pub struct SegmentLoader {
    directory: PathBuf,
    name: String,
    max_segment_size: usize,
    allocator: SegmentAllocator,
    min_free_disk_space: u64,
    metrics: Arc<dyn JournalMetrics>,
}

impl SegmentLoader {
    pub fn new(config: &JournalConfig, metrics: Arc<dyn JournalMetrics>) -> Self {
        Self {
            directory: config.directory.clone(),
            name: config.name.clone(),
            max_segment_size: config.max_segment_size,
            allocator: SegmentAllocator::from_preallocate(config.preallocate_segment_files),
            min_free_disk_space: config.min_free_disk_space,
            metrics,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(directory: &Path, max_segment_size: usize) -> Self {
        let config = JournalConfig {
            max_segment_size,
            preallocate_segment_files: false,
            ..JournalConfig::new(directory)
        };
        Self::new(&config, Arc::new(crate::metrics::NoopJournalMetrics))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn segment_path(&self, id: u64) -> PathBuf {
        file::segment_path(&self.directory, &self.name, id)
    }

    fn check_disk_space(&self) -> Result<()> {
        let required = (self.max_segment_size as u64).saturating_add(self.min_free_disk_space);
        let available = available_disk_space(&self.directory)?;
        if available < required {
            return Err(Error::OutOfDiskSpace {
                available,
                required,
            });
        }
        Ok(())
    }

    /// Creates, sizes and maps the file for segment `id`.
    pub fn create_uninitialized(&self, id: u64) -> Result<UninitializedSegment> {
        self.check_disk_space()?;
        let path = self.segment_path(id);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let watch = Stopwatch::start();
        let allocated = self
            .allocator
            .allocate(&mut file, self.max_segment_size as u64)
            .and_then(|()| MappedBuffer::map(&file, self.max_segment_size));
        let buffer = match allocated {
            Ok(buffer) => buffer,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(err);
            }
        };
        self.metrics.observe_segment_allocation(watch.elapsed());
        file::sync_directory(&self.directory)?;
        Ok(UninitializedSegment { id, path, buffer })
    }

    /// Writes the initial descriptor and forces it to disk.
    pub fn initialize(&self, segment: UninitializedSegment, start_index: i64) -> Result<Arc<Segment>> {
        let max_size = u32::try_from(segment.buffer.len())
            .map_err(|_| Error::InvalidConfig("max segment size must fit in 32 bits"))?;
        let descriptor = SegmentDescriptor::new(segment.id, start_index, max_size);
        segment.buffer.write(0, &descriptor.encode()?)?;
        segment
            .buffer
            .flush_range(0, DESCRIPTOR_SIZE)
            .map_err(|source| Error::Flush {
                segment_id: segment.id,
                source,
            })?;
        log::debug!(
            "initialized segment {} at index {} ({})",
            segment.id,
            start_index,
            segment.path.display()
        );
        Ok(Arc::new(Segment::new(segment.path, segment.buffer, descriptor)))
    }

    pub fn create_segment(&self, id: u64, start_index: i64) -> Result<Arc<Segment>> {
        let watch = Stopwatch::start();
        let segment = self.initialize(self.create_uninitialized(id)?, start_index)?;
        self.metrics.observe_segment_creation(watch.elapsed());
        Ok(segment)
    }

    /// Maps segment `id` and validates its descriptor.
    pub fn load_segment(&self, id: u64) -> Result<LoadedSegment> {
        let path = self.segment_path(id);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| Error::corrupted(format!("segment {id} exceeds addressable range")))?;
        if len == 0 {
            return Ok(LoadedSegment::Uninitialized(path));
        }
        let buffer = MappedBuffer::map(&file, len)?;
        if buffer.slice(0, 1)?[0] == VERSION_UNINITIALIZED {
            return Ok(LoadedSegment::Uninitialized(path));
        }
        if len < DESCRIPTOR_SIZE {
            return Err(Error::corrupted(format!(
                "segment {id} is {len} bytes, smaller than its descriptor"
            )));
        }
        let descriptor = SegmentDescriptor::decode(buffer.slice(0, DESCRIPTOR_SIZE)?)?;
        if descriptor.id != id {
            return Err(Error::corrupted(format!(
                "segment file {} holds descriptor of segment {}",
                path.display(),
                descriptor.id
            )));
        }
        let declared = descriptor.max_segment_size as usize;
        let buffer = if declared > len {
            // A crash while the file was being extended, or an external copy,
            // can leave it short. The missing tail reads back as zeroes, which
            // the recovery scan treats as the end of the data.
            log::warn!(
                "segment {id} is {len} bytes but its descriptor declares {declared}, extending {}",
                path.display()
            );
            drop(buffer);
            file.set_len(declared as u64)?;
            MappedBuffer::map(&file, declared)?
        } else {
            buffer
        };
        Ok(LoadedSegment::Initialized(Arc::new(Segment::new(
            path, buffer, descriptor,
        ))))
    }
}
