//! Core type definitions for dedupio
//!
//! This module defines the identity of cluster peers as observed through the
//! group transport: addresses, roles and reachability.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque network address of a group member.
///
/// The transport decides the format; the coordination layer only compares
/// and displays it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct NodeAddress(String);

impl NodeAddress {
    /// Create a new node address
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Get the address as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({:?})", self.0)
    }
}

/// Role a member plays in the cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// Chunk store
    #[default]
    Storage,
    /// Metadata (name) node
    Metadata,
}

/// Reachability of a member as last observed by the transport
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    /// Member answers requests
    #[default]
    Healthy,
    /// Failure detector suspects the member
    Suspected,
    /// Member cannot be reached at all
    Unreachable,
}

impl Reachability {
    /// Whether requests to this member can be expected to complete
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// A cluster peer acting as a chunk store or metadata node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodeRef {
    /// Transport address
    pub address: NodeAddress,
    /// Storage or metadata
    pub role: NodeRole,
    /// Last observed reachability
    pub reachability: Reachability,
    /// Logical volumes this node advertises
    pub volumes: Vec<String>,
}

impl StorageNodeRef {
    /// Create a healthy node reference without volumes
    pub fn new(address: impl Into<String>, role: NodeRole) -> Self {
        Self {
            address: NodeAddress::new(address),
            role,
            reachability: Reachability::Healthy,
            volumes: Vec::new(),
        }
    }

    /// Advertise a volume on this node
    #[must_use]
    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }

    /// Set reachability
    #[must_use]
    pub const fn with_reachability(mut self, reachability: Reachability) -> Self {
        self.reachability = reachability;
        self
    }
}
