use std::fs::File;
use std::ptr;
use std::slice;

use memmap2::{MmapOptions, MmapRaw};

use crate::{Error, Result};

/// A shared, bounds-checked view over a memory-mapped segment file.
///
/// All access goes through absolute offsets that are checked against the
/// mapping length. The buffer is shared between the single writer and any
/// number of readers; soundness relies on the segment's publication protocol:
///
/// - readers only borrow ranges below the segment's published end position;
/// - the writer only writes at or beyond that position, except while the
///   journal's structural lock is held exclusively (truncation), during which
///   no reader holds a borrowed range.
pub struct MappedBuffer {
    map: MmapRaw,
    len: usize,
}

impl MappedBuffer {
    pub fn map(file: &File, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidConfig("mmap length must be non-zero"));
        }
        let map = MmapOptions::new().len(len).map_raw(file)?;
        Ok(Self { map, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                capacity: self.len,
            }),
        }
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        // SAFETY: the range is inside the mapping, and the publication protocol
        // guarantees nobody writes into it while the borrow is alive.
        Ok(unsafe { slice::from_raw_parts(self.map.as_ptr().add(offset), len) })
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len())?;
        // SAFETY: bounds checked above; writes target unpublished ranges only.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    pub fn write_u8(&self, offset: usize, value: u8) -> Result<()> {
        self.write(offset, &[value])
    }

    pub fn flush_range(&self, offset: usize, len: usize) -> std::io::Result<()> {
        self.map.flush_range(offset, len)
    }
}
