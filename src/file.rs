//! Segment file naming and directory operations.
//!
//! Stateless helpers over paths. Segment files are named
//! `{name}-{id:09}.log`; a segment being deleted is first renamed to
//! `{name}-{id:09}.log.deleted` so a crash in the middle of a deletion leaves
//! an unambiguous leftover that the next open removes.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::Result;

const SEGMENT_EXTENSION: &str = ".log";
const DELETED_EXTENSION: &str = ".log.deleted";

// ============================================================================
// Naming
// ============================================================================

/// Segment filename for `id`, e.g. `journal-000000042.log`.
pub fn segment_filename(name: &str, id: u64) -> String {
    format!("{name}-{id:09}{SEGMENT_EXTENSION}")
}

pub fn segment_path(dir: &Path, name: &str, id: u64) -> PathBuf {
    dir.join(segment_filename(name, id))
}

pub fn deleted_path(segment_path: &Path) -> PathBuf {
    let mut os = segment_path.as_os_str().to_os_string();
    os.push(".deleted");
    PathBuf::from(os)
}

/// Returns the segment id if `file_name` is a live segment of journal `name`.
pub fn parse_segment_filename(name: &str, file_name: &str) -> Option<u64> {
    parse_with_extension(name, file_name, SEGMENT_EXTENSION)
}

fn parse_deleted_filename(name: &str, file_name: &str) -> Option<u64> {
    parse_with_extension(name, file_name, DELETED_EXTENSION)
}

fn parse_with_extension(name: &str, file_name: &str, extension: &str) -> Option<u64> {
    let base = file_name
        .strip_prefix(name)?
        .strip_prefix('-')?
        .strip_suffix(extension)?;
    if base.len() != 9 || !base.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    base.parse().ok()
}

// ============================================================================
// Discovery
// ============================================================================

/// Live segment ids of journal `name` in `dir`, sorted ascending.
pub fn discover_segments(dir: &Path, name: &str) -> Result<Vec<u64>> {
    let mut ids = list_matching(dir, |file_name| parse_segment_filename(name, file_name))?;
    ids.sort_unstable();
    Ok(ids)
}

/// Removes segments left marked for deletion by a previous run.
///
/// Returns how many files were removed.
pub fn remove_deleted_segments(dir: &Path, name: &str) -> Result<usize> {
    let ids = list_matching(dir, |file_name| parse_deleted_filename(name, file_name))?;
    for id in &ids {
        let path = deleted_path(&segment_path(dir, name, *id));
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("removed leftover {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    if !ids.is_empty() {
        sync_directory(dir)?;
    }
    Ok(ids.len())
}

fn list_matching(dir: &Path, parse: impl Fn(&str) -> Option<u64>) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        if let Some(id) = file_name.to_str().and_then(&parse) {
            ids.push(id);
        }
    }
    Ok(ids)
}

// ============================================================================
// Durability
// ============================================================================

/// Fsyncs a directory so that entry creations and renames in it survive a crash.
#[cfg(unix)]
pub fn sync_directory(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub fn sync_directory(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Renames a segment to its marked-for-deletion name and syncs the directory.
pub fn mark_for_deletion(path: &Path) -> io::Result<PathBuf> {
    let target = deleted_path(path);
    fs::rename(path, &target)?;
    if let Some(dir) = path.parent() {
        sync_directory(dir)?;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn segment_naming() {
        assert_eq!(segment_filename("journal", 42), "journal-000000042.log");
        assert_eq!(parse_segment_filename("journal", "journal-000000042.log"), Some(42));
        assert_eq!(parse_segment_filename("journal", "journal-42.log"), None);
        assert_eq!(parse_segment_filename("journal", "other-000000042.log"), None);
        assert_eq!(
            parse_segment_filename("journal", "journal-000000042.log.deleted"),
            None
        );
        assert_eq!(
            parse_deleted_filename("journal", "journal-000000042.log.deleted"),
            Some(42)
        );
    }

    #[test]
    fn discovery_is_sorted_and_filtered() {
        let dir = tempdir().expect("tempdir");
        for id in [3u64, 1, 2] {
            File::create(segment_path(dir.path(), "j", id)).expect("create");
        }
        File::create(dir.path().join("j.meta")).expect("create meta");
        File::create(dir.path().join("k-000000009.log")).expect("create other");
        assert_eq!(discover_segments(dir.path(), "j").expect("discover"), vec![1, 2, 3]);
    }

    #[test]
    fn marked_segments_are_removed_on_cleanup() {
        let dir = tempdir().expect("tempdir");
        let path = segment_path(dir.path(), "j", 7);
        File::create(&path).expect("create");
        let marked = mark_for_deletion(&path).expect("mark");
        assert!(!path.exists());
        assert!(marked.exists());
        assert!(discover_segments(dir.path(), "j").expect("discover").is_empty());

        assert_eq!(remove_deleted_segments(dir.path(), "j").expect("cleanup"), 1);
        assert!(!marked.exists());
    }

    #[test]
    fn missing_directory_has_no_segments() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        assert!(discover_segments(&missing, "j").expect("discover").is_empty());
    }
}
