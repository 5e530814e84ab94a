//! Metadata tree store
//!
//! Paths are logical, `/`-separated and rooted at the volume. The import only
//! needs to look entries up, list children, remove and rename.

use crate::error::{ImportError, ImportResult};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Directory receiving soft-deleted entries, under the store root
pub const TRASH_DIR: &str = ".trash";

/// One file or directory record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataEntry {
    path: String,
    is_dir: bool,
}

impl MetadataEntry {
    pub fn new(path: impl Into<String>, is_dir: bool) -> Self {
        Self {
            path: path.into(),
            is_dir,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub const fn is_directory(&self) -> bool {
        self.is_dir
    }
}

/// Hierarchical file/directory records of a volume
pub trait MetadataStore: Send + Sync {
    /// Look an entry up; `None` when absent
    fn get(&self, path: &str) -> ImportResult<Option<MetadataEntry>>;

    /// Child names of a directory, sorted
    fn list(&self, path: &str) -> ImportResult<Vec<String>>;

    /// Remove an entry and everything below it. Absent entries are ignored.
    /// Without `permanent` the entry stays recoverable.
    fn remove_entry(&self, path: &str, permanent: bool) -> ImportResult<()>;

    /// Move `from` to `to`, replacing whatever is at `to`. The replaced entry
    /// is kept recoverable unless `permanent` is set.
    fn rename_entry(&self, from: &str, to: &str, permanent: bool) -> ImportResult<()>;

    /// Where a logical path lives on disk
    fn physical_path(&self, path: &str) -> ImportResult<PathBuf>;
}

/// [`MetadataStore`] over the volume's own directory tree
#[derive(Clone, Debug)]
pub struct FsMetadataStore {
    root: PathBuf,
}

impl FsMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> ImportResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ImportError::InvalidPath(path.to_string()));
        }
        if relative.starts_with(TRASH_DIR) {
            return Err(ImportError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn trash(&self, physical: &Path) -> ImportResult<()> {
        let trash = self.root.join(TRASH_DIR);
        fs::create_dir_all(&trash)?;
        let target = trash.join(Uuid::new_v4().simple().to_string());
        debug!("Moving {} to {}", physical.display(), target.display());
        fs::rename(physical, target)?;
        Ok(())
    }

    fn delete(physical: &Path) -> ImportResult<()> {
        if physical.is_dir() {
            fs::remove_dir_all(physical)?;
        } else {
            fs::remove_file(physical)?;
        }
        Ok(())
    }
}

impl MetadataStore for FsMetadataStore {
    fn get(&self, path: &str) -> ImportResult<Option<MetadataEntry>> {
        let physical = self.resolve(path)?;
        match fs::symlink_metadata(&physical) {
            Ok(meta) => Ok(Some(MetadataEntry::new(path, meta.is_dir()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, path: &str) -> ImportResult<Vec<String>> {
        let physical = self.resolve(path)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&physical)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if physical == self.root && name == TRASH_DIR {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn remove_entry(&self, path: &str, permanent: bool) -> ImportResult<()> {
        let physical = self.resolve(path)?;
        if fs::symlink_metadata(&physical).is_err() {
            return Ok(());
        }
        if permanent {
            Self::delete(&physical)
        } else {
            self.trash(&physical)
        }
    }

    fn rename_entry(&self, from: &str, to: &str, permanent: bool) -> ImportResult<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if target.exists() {
            self.remove_entry(to, permanent)?;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&source, &target)?;
        debug!("Renamed {} to {}", from, to);
        Ok(())
    }

    fn physical_path(&self, path: &str) -> ImportResult<PathBuf> {
        self.resolve(path)
    }
}
