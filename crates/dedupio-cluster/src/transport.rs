//! Group transport contract
//!
//! The transport owns membership, addressing and delivery. The coordination
//! layer only needs to broadcast one payload and inspect one response per
//! member, under a response policy.

use crate::error::ClusterResult;
use async_trait::async_trait;
use bytes::Bytes;
use dedupio_common::{NodeAddress, StorageNodeRef};
use std::time::Duration;

/// How many responses a broadcast waits for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseMode {
    /// Return once the first member has answered. Answers that already
    /// arrived by then are included; the rest are `NotReceived`.
    #[default]
    First,
    /// Wait for every reachable member
    All,
    /// Fire and forget
    None,
}

/// Response collection policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub mode: ResponseMode,
    /// Bound on response collection; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    #[must_use]
    pub const fn first() -> Self {
        Self {
            mode: ResponseMode::First,
            timeout: None,
        }
    }

    #[must_use]
    pub const fn all() -> Self {
        Self {
            mode: ResponseMode::All,
            timeout: None,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What one member answered
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Handler returned a payload
    Value(Bytes),
    /// Handler completed without a payload
    NoValue,
    /// Handler failed
    Exception(String),
    /// Failure detector suspected the member
    Suspected,
    /// Member could not be reached
    Unreachable,
    /// Collection ended (policy or timeout) before this member answered
    NotReceived,
}

/// One member's response to a broadcast
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerResponse {
    pub sender: NodeAddress,
    pub outcome: ResponseOutcome,
}

impl PeerResponse {
    pub const fn new(sender: NodeAddress, outcome: ResponseOutcome) -> Self {
        Self { sender, outcome }
    }

    #[must_use]
    pub const fn was_suspected_or_unreachable(&self) -> bool {
        matches!(
            self.outcome,
            ResponseOutcome::Suspected | ResponseOutcome::Unreachable
        )
    }
}

/// Group communication substrate
#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// This node's address
    fn local_address(&self) -> NodeAddress;

    /// Current membership view, including this node
    fn members(&self) -> Vec<StorageNodeRef>;

    /// Current coordinator, as decided by the membership protocol
    fn coordinator(&self) -> Option<NodeAddress>;

    /// Broadcast `payload` to every member and collect responses
    async fn cast(&self, payload: Bytes, options: RequestOptions)
    -> ClusterResult<Vec<PeerResponse>>;
}
