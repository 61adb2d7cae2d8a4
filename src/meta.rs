//! Persistence of the last flushed index.
//!
//! The journal records the highest index known to be durable after every
//! flush. On open, that value separates corruption in flushed data (fatal)
//! from a torn unflushed tail (healed).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{Error, Result};

pub trait JournalMetaStore: Send + Sync {
    fn store_last_flushed_index(&self, index: i64) -> Result<()>;

    /// The persisted index, or `None` if nothing was ever stored (or it was reset).
    fn load_last_flushed_index(&self) -> Result<Option<i64>>;

    fn reset_last_flushed_index(&self) -> Result<()>;

    fn has_last_flushed_index(&self) -> Result<bool> {
        Ok(self.load_last_flushed_index()?.is_some())
    }
}

#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    index: Mutex<Option<i64>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JournalMetaStore for MemoryMetaStore {
    fn store_last_flushed_index(&self, index: i64) -> Result<()> {
        *self
            .index
            .lock()
            .map_err(|_| Error::Poisoned("meta store"))? = Some(index);
        Ok(())
    }

    fn load_last_flushed_index(&self) -> Result<Option<i64>> {
        Ok(*self.index.lock().map_err(|_| Error::Poisoned("meta store"))?)
    }

    fn reset_last_flushed_index(&self) -> Result<()> {
        *self
            .index
            .lock()
            .map_err(|_| Error::Poisoned("meta store"))? = None;
        Ok(())
    }
}

const META_FILE_LEN: usize = 12;

/// Stores the index in `{name}.meta` as `[index i64 LE][crc32 u32 LE]`.
///
/// Every store is followed by `sync_all`. A file whose checksum does not match
/// is reported as "no index" with a warning, which only relaxes the
/// corruption check on the next open.
#[derive(Debug)]
pub struct FileMetaStore {
    path: PathBuf,
    cached: Mutex<Option<Option<i64>>>,
}

impl FileMetaStore {
    pub fn new(directory: &Path, name: &str) -> Self {
        Self {
            path: directory.join(format!("{name}.meta")),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<Option<i64>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut buf = Vec::with_capacity(META_FILE_LEN);
        file.read_to_end(&mut buf)?;
        Ok(decode_meta(&buf).or_else(|| {
            log::warn!(
                "ignoring unreadable last flushed index in {}",
                self.path.display()
            );
            None
        }))
    }
}

impl JournalMetaStore for FileMetaStore {
    fn store_last_flushed_index(&self, index: i64) -> Result<()> {
        let mut cached = self.cached.lock().map_err(|_| Error::Poisoned("meta store"))?;
        if *cached == Some(Some(index)) {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(&encode_meta(index))?;
        file.sync_all()?;
        *cached = Some(Some(index));
        Ok(())
    }

    fn load_last_flushed_index(&self) -> Result<Option<i64>> {
        let mut cached = self.cached.lock().map_err(|_| Error::Poisoned("meta store"))?;
        if let Some(value) = *cached {
            return Ok(value);
        }
        let value = self.read_file()?;
        *cached = Some(value);
        Ok(value)
    }

    fn reset_last_flushed_index(&self) -> Result<()> {
        let mut cached = self.cached.lock().map_err(|_| Error::Poisoned("meta store"))?;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                if let Some(dir) = self.path.parent() {
                    crate::file::sync_directory(dir)?;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        *cached = Some(None);
        Ok(())
    }
}

fn encode_meta(index: i64) -> [u8; META_FILE_LEN] {
    let mut buf = [0u8; META_FILE_LEN];
    buf[0..8].copy_from_slice(&index.to_le_bytes());
    let crc = crc32fast::hash(&buf[0..8]);
    buf[8..12].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn decode_meta(buf: &[u8]) -> Option<i64> {
    if buf.len() != META_FILE_LEN {
        return None;
    }
    let index = i64::from_le_bytes(buf[0..8].try_into().ok()?);
    let crc = u32::from_le_bytes(buf[8..12].try_into().ok()?);
    (crc32fast::hash(&buf[0..8]) == crc).then_some(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryMetaStore::new();
        assert!(!store.has_last_flushed_index().expect("has"));
        store.store_last_flushed_index(12).expect("store");
        assert_eq!(store.load_last_flushed_index().expect("load"), Some(12));
        store.reset_last_flushed_index().expect("reset");
        assert_eq!(store.load_last_flushed_index().expect("load"), None);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let store = FileMetaStore::new(dir.path(), "journal");
        store.store_last_flushed_index(99).expect("store");
        assert!(store.path().exists());

        let reopened = FileMetaStore::new(dir.path(), "journal");
        assert_eq!(reopened.load_last_flushed_index().expect("load"), Some(99));

        reopened.reset_last_flushed_index().expect("reset");
        assert!(!reopened.path().exists());
        let again = FileMetaStore::new(dir.path(), "journal");
        assert!(!again.has_last_flushed_index().expect("has"));
    }

    #[test]
    fn damaged_file_reads_as_missing() {
        let dir = tempdir().expect("tempdir");
        let store = FileMetaStore::new(dir.path(), "journal");
        store.store_last_flushed_index(5).expect("store");
        let mut bytes = fs::read(store.path()).expect("read");
        bytes[0] ^= 0xFF;
        fs::write(store.path(), &bytes).expect("write");

        let reopened = FileMetaStore::new(dir.path(), "journal");
        assert_eq!(reopened.load_last_flushed_index().expect("load"), None);
    }
}
