//! Progress events for long-running cluster operations
//!
//! A [`ProgressEvent`] is an immutable description of an operation's
//! progress: counters, outcome and the snapshots of its sub-operations. It is
//! what crosses the network. An [`EventHandle`] is the live record owned by
//! the operation initiator; it accumulates counters and child snapshots and
//! is ended exactly once.
//!
//! ```text
//! initiator                         peers
//! ─────────                         ─────
//! EventHandle ──snapshot()──► bytes ──► handler builds its own event
//!      ▲                                        │
//!      └──── merge_children(remote) ◄── bytes ◄─┘
//! ```

use crate::error::{Error, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// What kind of operation an event describes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[default]
    Generic,
    /// Garbage collection sweep
    Gc,
    /// Chunk removal tally reported by a storage node
    Remover,
    /// Replicated archive import
    ArchiveImport,
    /// Pull of referenced block data from a remote peer
    MetadataImport,
}

/// Terminal outcome of an event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOutcome {
    Success { message: String },
    Warning { message: String },
    Error { message: String, cause: String },
}

impl EventOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self::Success {
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Error {
            message: message.into(),
            cause: cause.to_string(),
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Snapshot of an operation's progress
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Unique event ID
    pub id: String,
    pub kind: EventKind,
    pub description: String,
    /// Items processed
    pub action_count: u64,
    /// Expected total (items or bytes, depending on the operation)
    pub max_count: u64,
    /// Bytes processed so far
    pub current_count: u64,
    pub done: bool,
    pub outcome: Option<EventOutcome>,
    /// Snapshots contributed by sub-operations, in arrival order
    pub children: Vec<ProgressEvent>,
    /// Start time (epoch millis)
    pub started_at: i64,
    /// End time (epoch millis), set once done
    pub ended_at: Option<i64>,
}

impl ProgressEvent {
    /// Create a new running event
    pub fn new(kind: EventKind, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            description: description.into(),
            action_count: 0,
            max_count: 0,
            current_count: 0,
            done: false,
            outcome: None,
            children: Vec::new(),
            started_at: Utc::now().timestamp_millis(),
            ended_at: None,
        }
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Whether the event ended successfully
    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Some(EventOutcome::Success { .. }))
    }
}

/// Live, shareable owner of a [`ProgressEvent`].
///
/// Counters only grow. Once [`EventHandle::end`] has been called every
/// further mutation is ignored.
#[derive(Clone, Debug)]
pub struct EventHandle {
    inner: Arc<Mutex<ProgressEvent>>,
}

impl EventHandle {
    /// Start tracking a new event
    pub fn new(kind: EventKind, description: impl Into<String>) -> Self {
        Self::from_snapshot(ProgressEvent::new(kind, description))
    }

    /// Resume tracking from a snapshot (e.g. one received from a peer)
    #[must_use]
    pub fn from_snapshot(event: ProgressEvent) -> Self {
        Self {
            inner: Arc::new(Mutex::new(event)),
        }
    }

    pub fn id(&self) -> String {
        self.inner.lock().id.clone()
    }

    pub fn kind(&self) -> EventKind {
        self.inner.lock().kind
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    /// Immutable copy of the current state
    pub fn snapshot(&self) -> ProgressEvent {
        self.inner.lock().clone()
    }

    /// Raise the expected total; never lowers it
    pub fn set_max_count(&self, max: u64) -> bool {
        self.mutate("set_max_count", |e| e.max_count = e.max_count.max(max))
    }

    pub fn add_actions(&self, n: u64) -> bool {
        self.mutate("add_actions", |e| {
            e.action_count = e.action_count.saturating_add(n);
        })
    }

    pub fn add_bytes(&self, n: u64) -> bool {
        self.mutate("add_bytes", |e| {
            e.current_count = e.current_count.saturating_add(n);
        })
    }

    /// Append a sub-operation's snapshot
    pub fn add_child(&self, child: ProgressEvent) -> bool {
        self.mutate("add_child", |e| e.children.push(child))
    }

    /// Accumulate the children of a remote event into this one
    pub fn merge_children(&self, remote: &ProgressEvent) -> bool {
        self.mutate("merge_children", |e| {
            e.children.extend(remote.children.iter().cloned());
        })
    }

    /// Mark the event done. Returns false if it had already ended.
    pub fn end(&self, outcome: EventOutcome) -> bool {
        self.mutate("end", |e| {
            e.done = true;
            e.outcome = Some(outcome);
            e.ended_at = Some(Utc::now().timestamp_millis());
        })
    }

    fn mutate(&self, op: &str, f: impl FnOnce(&mut ProgressEvent)) -> bool {
        let mut event = self.inner.lock();
        if event.done {
            debug!("Ignoring {} on finished event {}", op, event.id);
            return false;
        }
        f(&mut event);
        true
    }
}
