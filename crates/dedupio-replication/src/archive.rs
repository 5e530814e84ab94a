//! Replicated archive access
//!
//! An archive holds two subtrees: `files/`, whose first entry is the root of
//! the replicated file records, and `ddb/`, a snapshot of the source volume's
//! deduplication database.

use crate::error::{ImportError, ImportResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Subtree holding the replicated file records
pub const FILES_DIR: &str = "files";
/// Subtree holding the deduplication database snapshot
pub const DDB_DIR: &str = "ddb";

/// Receives copy progress and decides whether to keep going
pub trait CopyObserver: Send + Sync {
    /// Checked before each entry is copied
    fn is_cancelled(&self) -> bool;

    /// Called after each file with its size
    fn on_copied(&self, bytes: u64);
}

/// Reads a packaged archive
pub trait ArchiveReader: Send + Sync {
    fn exists(&self, archive: &Path) -> bool;

    /// Sorted child names of `subtree` (`""` for the archive root). Missing
    /// subtrees have no children.
    fn list(&self, archive: &Path, subtree: &str) -> ImportResult<Vec<String>>;

    /// Total file bytes below `subtree`; zero when missing
    fn subtree_size(&self, archive: &Path, subtree: &str) -> ImportResult<u64>;

    /// Copy `subtree` to `dest`, creating directories as needed. A directory
    /// subtree has its contents placed under `dest`. Returns bytes copied.
    fn copy_subtree(
        &self,
        archive: &Path,
        subtree: &str,
        dest: &Path,
        observer: &dyn CopyObserver,
    ) -> ImportResult<u64>;
}

/// [`ArchiveReader`] for archives already unpacked to a directory
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectoryArchive;

impl DirectoryArchive {
    fn locate(archive: &Path, subtree: &str) -> PathBuf {
        if subtree.is_empty() {
            archive.to_path_buf()
        } else {
            archive.join(subtree)
        }
    }
}

impl ArchiveReader for DirectoryArchive {
    fn exists(&self, archive: &Path) -> bool {
        archive.is_dir()
    }

    fn list(&self, archive: &Path, subtree: &str) -> ImportResult<Vec<String>> {
        let dir = Self::locate(archive, subtree);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn subtree_size(&self, archive: &Path, subtree: &str) -> ImportResult<u64> {
        let root = Self::locate(archive, subtree);
        if !root.exists() {
            return Ok(0);
        }
        let mut total = 0u64;
        for entry in WalkDir::new(&root) {
            let entry = entry.map_err(|e| ImportError::Io(e.into()))?;
            if entry.file_type().is_file() {
                let len = entry.metadata().map_err(|e| ImportError::Io(e.into()))?.len();
                total = total.saturating_add(len);
            }
        }
        Ok(total)
    }

    fn copy_subtree(
        &self,
        archive: &Path,
        subtree: &str,
        dest: &Path,
        observer: &dyn CopyObserver,
    ) -> ImportResult<u64> {
        let root = Self::locate(archive, subtree);
        let mut copied = 0u64;
        for entry in WalkDir::new(&root).sort_by_file_name() {
            if observer.is_cancelled() {
                debug!("Copy of {} cancelled", root.display());
                return Err(ImportError::CancellationRequested);
            }
            let entry = entry.map_err(|e| ImportError::Io(e.into()))?;
            let relative = entry
                .path()
                .strip_prefix(&root)
                .map_err(|e| ImportError::InvalidPath(e.to_string()))?;
            let target = if relative.as_os_str().is_empty() {
                dest.to_path_buf()
            } else {
                dest.join(relative)
            };

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let len = fs::copy(entry.path(), &target)?;
                copied = copied.saturating_add(len);
                observer.on_copied(len);
            }
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Default)]
    struct Recorder {
        cancelled: AtomicBool,
        bytes: AtomicU64,
    }

    impl CopyObserver for Recorder {
        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }

        fn on_copied(&self, bytes: u64) {
            self.bytes.fetch_add(bytes, Ordering::SeqCst);
        }
    }

    fn archive() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let files = dir.path().join("files/a1/sub");
        fs::create_dir_all(&files).unwrap();
        fs::write(dir.path().join("files/a1/one"), vec![0u8; 100]).unwrap();
        fs::write(files.join("two"), vec![0u8; 50]).unwrap();
        fs::create_dir_all(dir.path().join("ddb/hashes")).unwrap();
        fs::write(dir.path().join("ddb/hashes/0001"), b"hdb").unwrap();
        dir
    }

    #[test]
    fn test_list_and_size() {
        let dir = archive();
        let reader = DirectoryArchive;

        assert!(reader.exists(dir.path()));
        assert!(!reader.exists(&dir.path().join("absent")));
        assert_eq!(reader.list(dir.path(), "").unwrap(), vec!["ddb", "files"]);
        assert_eq!(reader.list(dir.path(), FILES_DIR).unwrap(), vec!["a1"]);
        assert!(reader.list(dir.path(), "nothing").unwrap().is_empty());
        assert_eq!(reader.subtree_size(dir.path(), FILES_DIR).unwrap(), 150);
        assert_eq!(reader.subtree_size(dir.path(), "nothing").unwrap(), 0);
    }

    #[test]
    fn test_copy_subtree() {
        let dir = archive();
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("staged");
        let observer = Recorder::default();

        let copied = DirectoryArchive
            .copy_subtree(dir.path(), "files/a1", &dest, &observer)
            .unwrap();

        assert_eq!(copied, 150);
        assert_eq!(observer.bytes.load(Ordering::SeqCst), 150);
        assert_eq!(fs::read(dest.join("sub/two")).unwrap().len(), 50);
    }

    #[test]
    fn test_copy_stops_when_cancelled() {
        let dir = archive();
        let out = tempfile::tempdir().unwrap();
        let observer = Recorder::default();
        observer.cancelled.store(true, Ordering::SeqCst);

        let result = DirectoryArchive.copy_subtree(dir.path(), DDB_DIR, out.path(), &observer);
        assert!(matches!(result, Err(ImportError::CancellationRequested)));
        assert_eq!(observer.bytes.load(Ordering::SeqCst), 0);
    }
}
