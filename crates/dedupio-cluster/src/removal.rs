//! Cluster-wide chunk removal
//!
//! The initiator broadcasts one `RUN_REMOVE` command and folds each member's
//! reply into its own event. One exception or one unreachable member fails
//! the whole broadcast: a removal that not every member confirmed is
//! reported as a failure for the caller to retry, never as a partial count.

use crate::command::{ClusterCommand, CommandHandler, RemoveChunksCommand};
use crate::error::{ClusterError, ClusterResult};
use crate::sweeper::ChunkSweeper;
use crate::transport::{GroupTransport, RequestOptions, ResponseOutcome};
use async_trait::async_trait;
use bytes::Bytes;
use dedupio_common::{EventHandle, EventKind, EventOutcome, NodeAddress, ProgressEvent};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Parameters of one removal broadcast
#[derive(Clone, Debug)]
pub struct RemovalRequest {
    /// Chunks last referenced before this time (epoch millis) are candidates
    pub older_than: i64,
    /// Bypass the soft-delete grace period
    pub force: bool,
    /// Aggregate event receiving every member's sub-events
    pub event: EventHandle,
}

impl RemovalRequest {
    pub const fn new(older_than: i64, force: bool, event: EventHandle) -> Self {
        Self {
            older_than,
            force,
            event,
        }
    }
}

/// Sends `RUN_REMOVE` to the group and aggregates the replies
pub struct ChunkRemovalBroadcast {
    transport: Arc<dyn GroupTransport>,
    options: RequestOptions,
}

impl ChunkRemovalBroadcast {
    /// Broadcast with the default policy: first response, no timeout
    pub fn new(transport: Arc<dyn GroupTransport>) -> Self {
        Self {
            transport,
            options: RequestOptions::default(),
        }
    }

    /// Override the response collection policy
    #[must_use]
    pub const fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the broadcast, returning the number of chunks removed cluster-wide
    pub async fn run(&self, request: &RemovalRequest) -> ClusterResult<u64> {
        metrics::counter!("dedupio_removal_broadcasts_total").increment(1);
        match self.collect(request).await {
            Ok(removed) => {
                metrics::counter!("dedupio_chunks_removed_total").increment(removed);
                info!("Removal broadcast removed {} chunks", removed);
                Ok(removed)
            }
            Err(e) => {
                metrics::counter!("dedupio_removal_failures_total").increment(1);
                error!("Removal broadcast failed: {}", e);
                Err(e)
            }
        }
    }

    async fn collect(&self, request: &RemovalRequest) -> ClusterResult<u64> {
        let payload = ClusterCommand::RemoveChunks(RemoveChunksCommand {
            older_than: request.older_than,
            force: request.force,
            event: request.event.snapshot(),
        })
        .encode()?;

        let responses = self.transport.cast(payload, self.options).await?;
        debug!("Removal broadcast collected {} responses", responses.len());

        let mut removed = 0u64;
        for response in responses {
            match response.outcome {
                ResponseOutcome::Exception(message) => {
                    return Err(ClusterError::PeerException {
                        peer: response.sender,
                        message,
                    });
                }
                ResponseOutcome::Suspected | ResponseOutcome::Unreachable => {
                    return Err(ClusterError::PeerUnreachable {
                        peer: response.sender,
                    });
                }
                ResponseOutcome::Value(bytes) => {
                    let remote = ProgressEvent::from_bytes(&bytes)?;
                    request.event.merge_children(&remote);
                    if remote.kind == EventKind::Remover {
                        removed = removed.saturating_add(remote.action_count);
                    }
                }
                ResponseOutcome::NoValue | ResponseOutcome::NotReceived => {}
            }
        }
        Ok(removed)
    }
}

/// Member-side handler for `RUN_REMOVE`
pub struct RemoveChunksHandler {
    node: NodeAddress,
    sweeper: Arc<dyn ChunkSweeper>,
}

impl RemoveChunksHandler {
    pub fn new(node: NodeAddress, sweeper: Arc<dyn ChunkSweeper>) -> Self {
        Self { node, sweeper }
    }
}

#[async_trait]
impl CommandHandler for RemoveChunksHandler {
    fn name(&self) -> &str {
        "remove-chunks"
    }

    async fn handle(&self, command: ClusterCommand) -> ClusterResult<Option<Bytes>> {
        let ClusterCommand::RemoveChunks(cmd) = command;
        debug!(
            "Removing chunks older than {} on {} (initiator event {})",
            cmd.older_than, self.node, cmd.event.id
        );

        let local = EventHandle::new(EventKind::Gc, format!("chunk sweep on {}", self.node));
        let sweeper = Arc::clone(&self.sweeper);
        let sweep_event = local.clone();
        let result = tokio::task::spawn_blocking(move || {
            sweeper.remove_chunks(cmd.older_than, cmd.force, &sweep_event)
        })
        .await
        .map_err(|e| ClusterError::Sweep(e.to_string()))?;

        let removed = match result {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Chunk sweep failed on {}: {}", self.node, e);
                local.end(EventOutcome::error("chunk sweep failed", &e));
                return Err(e);
            }
        };
        local.end(EventOutcome::success(format!("removed {removed} chunks")));

        let mut tally = ProgressEvent::new(EventKind::Remover, self.node.to_string());
        tally.action_count = removed;
        tally.children.push(local.snapshot());
        let tally = EventHandle::from_snapshot(tally);
        tally.end(EventOutcome::success("chunks removed"));

        Ok(Some(Bytes::from(tally.snapshot().to_bytes()?)))
    }
}
