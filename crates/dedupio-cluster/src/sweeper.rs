//! Local chunk removal
//!
//! Deciding which chunks are unreferenced belongs to the chunk store. What
//! this module owns is the removal step itself: given a threshold, drop the
//! chunks the store last touched before it.

use crate::error::{ClusterError, ClusterResult};
use dedupio_common::EventHandle;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Name of the soft-delete holding directory under the chunk root
pub const HOLDING_DIR: &str = ".deleted";

/// Removes chunks from the local store
pub trait ChunkSweeper: Send + Sync {
    /// Remove chunks last referenced before `older_than` (epoch millis).
    /// Returns the number of chunks removed.
    fn remove_chunks(&self, older_than: i64, force: bool, event: &EventHandle)
    -> ClusterResult<u64>;
}

/// Sweeps a directory of chunk files, using each file's modification time
/// as its last-reference time.
///
/// Without `force`, removed chunks are parked in [`HOLDING_DIR`] and only
/// deleted by the following sweep, so a chunk re-referenced in between can
/// still be recovered.
#[derive(Clone, Debug)]
pub struct DirectoryChunkSweeper {
    root: PathBuf,
    holding: PathBuf,
}

impl DirectoryChunkSweeper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let holding = root.join(HOLDING_DIR);
        Self { root, holding }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Chunks parked by the previous soft sweep
    pub fn held(&self) -> ClusterResult<Vec<PathBuf>> {
        if !self.holding.exists() {
            return Ok(Vec::new());
        }
        let mut held = Vec::new();
        for entry in WalkDir::new(&self.holding).min_depth(1) {
            let entry = entry.map_err(|e| ClusterError::Sweep(e.to_string()))?;
            if entry.file_type().is_file() {
                held.push(entry.into_path());
            }
        }
        held.sort();
        Ok(held)
    }

    fn purge_holding(&self) {
        if !self.holding.exists() {
            return;
        }
        for entry in WalkDir::new(&self.holding).min_depth(1).contents_first(true) {
            let result = match entry {
                Ok(entry) if entry.file_type().is_dir() => fs::remove_dir(entry.path()),
                Ok(entry) => fs::remove_file(entry.path()),
                Err(e) => {
                    warn!("Failed to walk holding directory: {}", e);
                    continue;
                }
            };
            if let Err(e) = result {
                warn!("Failed to purge held chunk: {}", e);
            }
        }
    }

    fn candidates(&self, threshold: SystemTime) -> ClusterResult<Vec<PathBuf>> {
        let mut found = Vec::new();
        let walker = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.path() != self.holding);
        for entry in walker {
            let entry = entry.map_err(|e| ClusterError::Sweep(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .map_err(|e| ClusterError::Sweep(e.to_string()))?
                .modified()?;
            if modified < threshold {
                found.push(entry.into_path());
            }
        }
        Ok(found)
    }

    fn park(&self, path: &Path) -> ClusterResult<()> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|e| ClusterError::Sweep(e.to_string()))?;
        // Same layout as the chunk root, so distinct chunks never share a name
        let parked = self.holding.join(relative);
        if let Some(parent) = parked.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(path, parked)?;
        Ok(())
    }
}

impl ChunkSweeper for DirectoryChunkSweeper {
    fn remove_chunks(
        &self,
        older_than: i64,
        force: bool,
        event: &EventHandle,
    ) -> ClusterResult<u64> {
        if !self.root.exists() {
            debug!("Chunk root {} does not exist", self.root.display());
            return Ok(0);
        }

        let threshold = UNIX_EPOCH + Duration::from_millis(u64::try_from(older_than).unwrap_or(0));
        if !force {
            self.purge_holding();
            fs::create_dir_all(&self.holding)?;
        }

        let candidates = self.candidates(threshold)?;
        event.set_max_count(candidates.len() as u64);

        let mut removed = 0u64;
        for path in candidates {
            let result = if force {
                fs::remove_file(&path).map_err(ClusterError::from)
            } else {
                self.park(&path)
            };
            match result {
                Ok(()) => {
                    removed += 1;
                    event.add_actions(1);
                }
                Err(e) => warn!("Failed to remove chunk '{}': {}", path.display(), e),
            }
        }

        info!(
            "Removed {} chunks from {} (force={})",
            removed,
            self.root.display(),
            force
        );
        Ok(removed)
    }
}
