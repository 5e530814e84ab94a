//! Cluster directory
//!
//! Snapshot queries over the transport's membership view, volume lookup and a
//! registry of process-local named locks.

use crate::error::{ClusterError, ClusterResult};
use crate::transport::GroupTransport;
use dashmap::DashMap;
use dedupio_common::{NodeAddress, NodeRole, StorageNodeRef};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Live view of the cluster
pub trait ClusterDirectory: Send + Sync {
    /// Members acting as chunk stores
    fn storage_nodes(&self) -> Vec<StorageNodeRef>;

    /// Members acting as metadata nodes
    fn name_nodes(&self) -> Vec<StorageNodeRef>;

    /// Every volume advertised by some member, sorted
    fn volumes(&self) -> Vec<String>;

    /// Address of a member advertising `volume`
    fn address_for_volume(&self, volume: &str) -> ClusterResult<NodeAddress>;

    /// Process-local mutex keyed by name, created on first use
    fn named_lock(&self, name: &str) -> Arc<Mutex<()>>;

    /// Whether this node currently holds the coordinator role
    fn is_coordinator(&self) -> bool;

    /// Broadcast facility
    fn dispatcher(&self) -> Arc<dyn GroupTransport>;
}

/// [`ClusterDirectory`] backed by a [`GroupTransport`]
pub struct GroupDirectory {
    transport: Arc<dyn GroupTransport>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GroupDirectory {
    pub fn new(transport: Arc<dyn GroupTransport>) -> Self {
        Self {
            transport,
            locks: DashMap::new(),
        }
    }

    fn with_role(&self, role: NodeRole) -> Vec<StorageNodeRef> {
        self.transport
            .members()
            .into_iter()
            .filter(|m| m.role == role)
            .collect()
    }
}

impl ClusterDirectory for GroupDirectory {
    fn storage_nodes(&self) -> Vec<StorageNodeRef> {
        self.with_role(NodeRole::Storage)
    }

    fn name_nodes(&self) -> Vec<StorageNodeRef> {
        self.with_role(NodeRole::Metadata)
    }

    fn volumes(&self) -> Vec<String> {
        let mut volumes: Vec<String> = self
            .transport
            .members()
            .into_iter()
            .flat_map(|m| m.volumes)
            .collect();
        volumes.sort();
        volumes.dedup();
        volumes
    }

    fn address_for_volume(&self, volume: &str) -> ClusterResult<NodeAddress> {
        let candidates: Vec<StorageNodeRef> = self
            .transport
            .members()
            .into_iter()
            .filter(|m| m.volumes.iter().any(|v| v == volume))
            .collect();

        candidates
            .iter()
            .find(|m| m.reachability.is_healthy())
            .or_else(|| candidates.first())
            .map(|m| m.address.clone())
            .ok_or_else(|| ClusterError::NotFound(format!("volume {volume}")))
    }

    fn named_lock(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn is_coordinator(&self) -> bool {
        self.transport.coordinator().as_ref() == Some(&self.transport.local_address())
    }

    fn dispatcher(&self) -> Arc<dyn GroupTransport> {
        Arc::clone(&self.transport)
    }
}
