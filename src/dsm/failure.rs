//! Failure handling driven by membership events.
//!
//! When a node is declared dead or leaves, the leases it held are revoked so
//! other writers are not blocked until expiry, and every ownership entry
//! pointing at it is forgotten together with the cached copies of its pages.

use std::sync::Arc;
use tokio::sync::broadcast;

use super::manager::MemoryManager;
use crate::membership::types::{MembershipEvent, NodeId};

/// What a departure cost the local engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepartureReport {
    pub node: NodeId,
    pub leases_revoked: usize,
    pub pages_forgotten: usize,
}

pub struct FailureHandler {
    manager: Arc<MemoryManager>,
}

impl FailureHandler {
    pub fn new(manager: Arc<MemoryManager>) -> Self {
        Self { manager }
    }

    /// Consumes membership events until the channel closes.
    pub async fn run(self, mut events: broadcast::Receiver<MembershipEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    self.handle_event(&event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Failure handler missed {} membership events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub fn handle_event(&self, event: &MembershipEvent) -> Option<DepartureReport> {
        if !event.is_departure() {
            return None;
        }
        Some(self.handle_departure(event.node_id()))
    }

    pub fn handle_departure(&self, node: &NodeId) -> DepartureReport {
        let leases_revoked = self.manager.lease_manager().revoke_leases_held_by(node).len();
        let pages_forgotten = self.manager.forget_owner(node).len();

        tracing::info!(
            "Node {} departed: revoked {} lease(s), forgot {} page owner(s)",
            node,
            leases_revoked,
            pages_forgotten
        );

        DepartureReport {
            node: node.clone(),
            leases_revoked,
            pages_forgotten,
        }
    }
}
