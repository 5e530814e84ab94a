//! Cluster coordination error types

use dedupio_common::NodeAddress;
use thiserror::Error;

/// Cluster coordination error
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A member was suspected or unreachable while a broadcast was collected
    #[error("peer unreachable: {peer}")]
    PeerUnreachable { peer: NodeAddress },

    /// A member reported an application-level failure
    #[error("I/O error reported by {peer}: {message}")]
    PeerException { peer: NodeAddress, message: String },

    /// Lookup failed (volume, member)
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed command or response payload
    #[error("codec error: {0}")]
    Codec(String),

    /// No handler registered for a command tag
    #[error("unknown command tag: {0:#04x}")]
    UnknownCommand(u8),

    /// Group transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid GC schedule
    #[error("schedule error: {0}")]
    Schedule(String),

    /// Local chunk sweep failed
    #[error("sweep error: {0}")]
    Sweep(String),

    /// Event encoding failure
    #[error(transparent)]
    Event(#[from] dedupio_common::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Whether the caller may simply retry the operation later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::PeerUnreachable { .. } | Self::Transport(_))
    }
}

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;
