//! In-process group transport
//!
//! [`LocalGroup`] delivers broadcasts to members living in the same process,
//! each with its own [`CommandRegistry`]. It backs single-node deployments
//! and lets tests stage partial failures by marking members suspected or
//! unreachable.

use crate::command::CommandRegistry;
use crate::error::ClusterResult;
use crate::transport::{GroupTransport, PeerResponse, RequestOptions, ResponseMode, ResponseOutcome};
use async_trait::async_trait;
use bytes::Bytes;
use dedupio_common::{NodeAddress, Reachability, StorageNodeRef};
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct LocalMember {
    node: StorageNodeRef,
    registry: Arc<CommandRegistry>,
}

/// Members sharing one process. Join order is view order; the first member
/// is the coordinator.
#[derive(Default)]
pub struct LocalGroup {
    members: RwLock<Vec<LocalMember>>,
}

impl LocalGroup {
    /// Create an empty group
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a member (or replace the member with the same address)
    pub fn join(&self, node: StorageNodeRef, registry: Arc<CommandRegistry>) {
        let mut members = self.members.write();
        if let Some(existing) = members.iter_mut().find(|m| m.node.address == node.address) {
            info!("Member {} rejoining group", node.address);
            existing.node = node;
            existing.registry = registry;
        } else {
            info!("Member {} joining group", node.address);
            members.push(LocalMember { node, registry });
        }
    }

    /// Remove a member from the view
    pub fn leave(&self, address: &NodeAddress) -> bool {
        let mut members = self.members.write();
        let before = members.len();
        members.retain(|m| &m.node.address != address);
        before != members.len()
    }

    /// Record what the failure detector thinks of a member
    pub fn set_reachability(&self, address: &NodeAddress, reachability: Reachability) {
        if let Some(member) = self
            .members
            .write()
            .iter_mut()
            .find(|m| &m.node.address == address)
        {
            if member.node.reachability != reachability {
                warn!("Member {} is now {:?}", address, reachability);
            }
            member.node.reachability = reachability;
        }
    }

    /// Transport view of the group from one member
    pub fn endpoint(self: &Arc<Self>, local: NodeAddress) -> LocalEndpoint {
        LocalEndpoint {
            group: Arc::clone(self),
            local,
        }
    }

    fn snapshot(&self) -> Vec<LocalMember> {
        self.members.read().clone()
    }
}

/// A member's handle on a [`LocalGroup`]
#[derive(Clone)]
pub struct LocalEndpoint {
    group: Arc<LocalGroup>,
    local: NodeAddress,
}

#[async_trait]
impl GroupTransport for LocalEndpoint {
    fn local_address(&self) -> NodeAddress {
        self.local.clone()
    }

    fn members(&self) -> Vec<StorageNodeRef> {
        self.group.snapshot().into_iter().map(|m| m.node).collect()
    }

    fn coordinator(&self) -> Option<NodeAddress> {
        self.group
            .members
            .read()
            .first()
            .map(|m| m.node.address.clone())
    }

    async fn cast(
        &self,
        payload: Bytes,
        options: RequestOptions,
    ) -> ClusterResult<Vec<PeerResponse>> {
        let members = self.group.snapshot();
        debug!(
            "Broadcasting {} bytes from {} to {} members ({:?})",
            payload.len(),
            self.local,
            members.len(),
            options.mode
        );

        let mut responses = Vec::with_capacity(members.len());
        let mut reachable = Vec::new();
        for member in members {
            match member.node.reachability {
                Reachability::Healthy => reachable.push(member),
                Reachability::Suspected => responses.push(PeerResponse::new(
                    member.node.address,
                    ResponseOutcome::Suspected,
                )),
                Reachability::Unreachable => responses.push(PeerResponse::new(
                    member.node.address,
                    ResponseOutcome::Unreachable,
                )),
            }
        }

        if options.mode == ResponseMode::None {
            for member in reachable {
                let payload = payload.clone();
                tokio::spawn(async move {
                    if let Err(e) = member.registry.dispatch(payload).await {
                        warn!("Command failed on {}: {}", member.node.address, e);
                    }
                });
            }
            return Ok(Vec::new());
        }

        let mut outstanding: HashSet<NodeAddress> =
            reachable.iter().map(|m| m.node.address.clone()).collect();
        let mut pending: FuturesUnordered<_> = reachable
            .into_iter()
            .map(|member| {
                let payload = payload.clone();
                async move {
                    let outcome = match member.registry.dispatch(payload).await {
                        Ok(Some(value)) => ResponseOutcome::Value(value),
                        Ok(None) => ResponseOutcome::NoValue,
                        Err(e) => ResponseOutcome::Exception(e.to_string()),
                    };
                    PeerResponse::new(member.node.address, outcome)
                }
            })
            .collect();

        let deadline = options.timeout.map(|t| Instant::now() + t);
        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!("Response collection timed out");
                        break;
                    }
                },
                None => pending.next().await,
            };
            let Some(response) = next else { break };
            outstanding.remove(&response.sender);
            responses.push(response);

            if options.mode == ResponseMode::First {
                // Keep answers that are already complete
                while let Some(Some(response)) = pending.next().now_or_never() {
                    outstanding.remove(&response.sender);
                    responses.push(response);
                }
                break;
            }
        }

        let mut missing: Vec<_> = outstanding.into_iter().collect();
        missing.sort();
        responses.extend(
            missing
                .into_iter()
                .map(|sender| PeerResponse::new(sender, ResponseOutcome::NotReceived)),
        );
        Ok(responses)
    }
}
