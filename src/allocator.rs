//! Disk space reservation for new segment files.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use crate::Result;

const ZERO_CHUNK: usize = 64 * 1024;

/// How a freshly created segment file gets its bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentAllocator {
    /// `posix_fallocate` where available, zero-filling otherwise.
    #[default]
    Fill,
    /// Only set the file length; blocks are allocated lazily on first write.
    None,
}

impl SegmentAllocator {
    pub fn from_preallocate(preallocate: bool) -> Self {
        if preallocate {
            SegmentAllocator::Fill
        } else {
            SegmentAllocator::None
        }
    }

    /// Sizes `file` to `len` bytes, reserving the blocks if configured to.
    pub fn allocate(&self, file: &mut File, len: u64) -> Result<()> {
        match self {
            SegmentAllocator::None => file.set_len(len)?,
            SegmentAllocator::Fill => {
                if !fallocate(file, len)? {
                    log::debug!("fallocate unsupported, zero-filling {len} bytes");
                    zero_fill(file, len)?;
                }
            }
        }
        Ok(())
    }
}

/// Returns `Ok(false)` when the filesystem does not support `posix_fallocate`.
#[cfg(target_os = "linux")]
fn fallocate(file: &File, len: u64) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let len = libc::off_t::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment length overflow"))?;
    // posix_fallocate returns the error number instead of setting errno.
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
    match rc {
        0 => Ok(true),
        libc::EOPNOTSUPP | libc::EINVAL => Ok(false),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

#[cfg(not(target_os = "linux"))]
fn fallocate(_file: &File, _len: u64) -> io::Result<bool> {
    Ok(false)
}

fn zero_fill(file: &mut File, len: u64) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    let chunk = [0u8; ZERO_CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(ZERO_CHUNK as u64) as usize;
        file.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }
    file.flush()
}

/// Bytes available to an unprivileged user on the filesystem holding `path`.
#[cfg(unix)]
pub fn available_disk_space(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(not(unix))]
pub fn available_disk_space(_path: &Path) -> io::Result<u64> {
    Ok(u64::MAX)
}
