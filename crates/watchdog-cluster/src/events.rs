//! Events reported to the embedding process, and the side effects the
//! engine collects while it holds the state lock.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ClusterConfig;
use crate::link::Link;
use crate::message::ClusterMessage;
use crate::slots::SlotRange;
use crate::state::ClusterState;
use crate::NodeId;

/// Topology changes observed by this node.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    /// A node was added to the registry with its real name.
    NodeAdded(NodeId, SocketAddr),
    /// No PONG within the node timeout.
    NodeSuspected(NodeId),
    /// The node was confirmed FAIL, locally or by a FAIL message.
    NodeFailed(NodeId),
    /// A suspected or failed node answered again.
    NodeRecovered(NodeId),
    /// The node was removed by an administrative forget.
    NodeForgotten(NodeId),
    /// The node's slot ownership changed.
    SlotsChanged(NodeId, Vec<SlotRange>),
    /// This node won a failover election at the given config epoch.
    FailoverWon { epoch: u64, replaced: NodeId },
    /// This node stepped down to replicate the given primary.
    BecameReplica(NodeId),
}

/// Inputs shared by every engine step: configuration, the current time in
/// unix millis, and the replication offset to advertise.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub config: &'a ClusterConfig,
    pub now: u64,
    pub replication_offset: u64,
}

/// Messages and events produced under the state lock and dispatched after
/// it is released, so sends never run while the lock is held.
#[derive(Debug, Default)]
pub struct Effects {
    pub sends: Vec<(Arc<Link>, Arc<ClusterMessage>)>,
    pub events: Vec<ClusterEvent>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `msg` on one link.
    pub fn send(&mut self, link: &Arc<Link>, msg: ClusterMessage) {
        self.sends.push((Arc::clone(link), Arc::new(msg)));
    }

    /// Queues `msg` to every node with a live link, excluding myself and
    /// nodes still in handshake.
    pub fn broadcast(&mut self, state: &ClusterState, msg: ClusterMessage) {
        let msg = Arc::new(msg);
        for node in state.nodes() {
            if node.is_myself() || node.in_handshake() {
                continue;
            }
            if let Some(link) = &node.link {
                self.sends.push((Arc::clone(link), Arc::clone(&msg)));
            }
        }
    }

    pub fn event(&mut self, event: ClusterEvent) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.events.is_empty()
    }
}
