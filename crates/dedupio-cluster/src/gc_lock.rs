//! Garbage collection coordination lock
//!
//! One readers/writer lock per process. The sweep holds it exclusively;
//! imports hold it shared for their whole duration, so a sweep never sees
//! chunk references that are still in transit.
//!
//! Acquisition waits without a bound. A stalled import therefore delays every
//! later sweep; the holder's guard is the only way to release.

use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

/// Process-wide GC/import exclusion. Clones share the same lock.
#[derive(Clone, Debug, Default)]
pub struct GcCoordinationLock {
    inner: Arc<RwLock<()>>,
}

impl GcCoordinationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no import or sweep holds the lock
    pub async fn acquire_exclusive(&self) -> SweepGuard {
        debug!("Waiting for exclusive GC lock");
        let guard = Arc::clone(&self.inner).write_owned().await;
        debug!("Exclusive GC lock acquired");
        SweepGuard { _guard: guard }
    }

    /// Take the exclusive side only if it is free right now
    pub fn try_acquire_exclusive(&self) -> Option<SweepGuard> {
        Arc::clone(&self.inner)
            .try_write_owned()
            .ok()
            .map(|guard| SweepGuard { _guard: guard })
    }

    /// Wait until no sweep holds the lock
    pub async fn acquire_shared(&self) -> ImportGuard {
        debug!("Waiting for shared GC lock");
        let guard = Arc::clone(&self.inner).read_owned().await;
        debug!("Shared GC lock acquired");
        ImportGuard { _guard: guard }
    }
}

/// Held by the sweep; released on drop
#[derive(Debug)]
pub struct SweepGuard {
    _guard: OwnedRwLockWriteGuard<()>,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        debug!("Exclusive GC lock released");
    }
}

/// Held by an import; released on drop
#[derive(Debug)]
pub struct ImportGuard {
    _guard: OwnedRwLockReadGuard<()>,
}

impl Drop for ImportGuard {
    fn drop(&mut self) {
        debug!("Shared GC lock released");
    }
}
