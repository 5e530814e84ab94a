//! Running import table
//!
//! Imports register under their event id so that an operator can cancel them
//! from another task.

use crate::error::{ImportError, ImportResult};
use crate::import::ImportTransaction;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
pub struct ImportRegistry {
    jobs: DashMap<String, Arc<ImportTransaction>>,
}

impl ImportRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track `tx` until the returned guard drops. An id already in the table
    /// is refused; the running import keeps its entry.
    pub fn register(self: &Arc<Self>, tx: Arc<ImportTransaction>) -> ImportResult<Registration> {
        let id = tx.id().to_string();
        match self.jobs.entry(id.clone()) {
            Entry::Occupied(_) => return Err(ImportError::DuplicateJob(id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        debug!("Registered import {}", id);
        Ok(Registration {
            registry: Arc::clone(self),
            id,
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<ImportTransaction>> {
        self.jobs.get(id).map(|tx| Arc::clone(tx.value()))
    }

    /// Cancel a running import
    pub fn cancel(&self, id: &str) -> ImportResult<()> {
        let tx = self
            .get(id)
            .ok_or_else(|| ImportError::JobNotFound(id.to_string()))?;
        info!("Cancelling import {}", id);
        tx.close();
        Ok(())
    }

    /// Ids of running imports, sorted
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Removes an import from the table on drop
pub struct Registration {
    registry: Arc<ImportRegistry>,
    id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        debug!("Deregistering import {}", self.id);
        self.registry.jobs.remove(&self.id);
    }
}
