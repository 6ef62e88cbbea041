//! The node registry and cluster-wide epochs.
//!
//! `ClusterState` is the single authority nodes are identified against.
//! Handlers look nodes up by name and never keep references across calls;
//! a replica's primary is re-resolved through [`ClusterState::lookup`] on
//! every use.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::election::FailoverState;
use crate::link::{attach_link, free_link};
use crate::message::ClusterHealth;
use crate::node::{ClusterNode, NodeRole};
use crate::slots::SlotBitmap;
use crate::{ClusterError, NodeId};

/// Process-wide cluster view held by one node.
#[derive(Debug)]
pub struct ClusterState {
    nodes: BTreeMap<NodeId, ClusterNode>,
    myself: NodeId,
    /// Highest epoch seen anywhere in the cluster.
    pub current_epoch: u64,
    /// Highest epoch in which this node granted a failover vote.
    pub last_vote_epoch: u64,
    /// Derived from slot coverage by [`ClusterState::update_health`].
    pub health: ClusterHealth,
    /// Election progress while this node is a replica of a failed primary.
    pub failover: FailoverState,
}

impl ClusterState {
    /// Creates a registry containing only the local node.
    pub fn new(mut myself: ClusterNode) -> Self {
        myself.set_myself();
        let id = myself.id;
        let mut nodes = BTreeMap::new();
        nodes.insert(id, myself);
        let mut state = Self {
            nodes,
            myself: id,
            current_epoch: 0,
            last_vote_epoch: 0,
            health: ClusterHealth::Fail,
            failover: FailoverState::default(),
        };
        state.update_health();
        state
    }

    pub fn myself_id(&self) -> NodeId {
        self.myself
    }

    /// The local node. It is inserted at construction and can't be forgotten.
    pub fn myself(&self) -> &ClusterNode {
        &self.nodes[&self.myself]
    }

    pub fn myself_mut(&mut self) -> &mut ClusterNode {
        self.nodes
            .get_mut(&self.myself)
            .unwrap_or_else(|| unreachable!("myself is never removed"))
    }

    pub fn lookup(&self, id: &NodeId) -> Option<&ClusterNode> {
        self.nodes.get(id)
    }

    pub fn lookup_mut(&mut self, id: &NodeId) -> Option<&mut ClusterNode> {
        self.nodes.get_mut(id)
    }

    /// Every known node, ordered by name.
    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut ClusterNode> {
        self.nodes.values_mut()
    }

    /// IDs of every known node, ordered by name.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts `node`, or refreshes the address of an existing record with
    /// the same name. Returns true if the node is new.
    ///
    /// An existing record keeps its flags, epochs and link. The myself flag
    /// is never carried onto an inserted node.
    pub fn upsert(&mut self, mut node: ClusterNode) -> bool {
        if let Some(existing) = self.nodes.get_mut(&node.id) {
            if node.has_addr() {
                existing.addr = node.addr;
                existing.bus_port = node.bus_port;
                existing.flags.noaddr = false;
            }
            return false;
        }
        node.flags.myself = false;
        debug!("adding node {} at {}", node.id, node.addr);
        self.nodes.insert(node.id, node);
        true
    }

    /// Turns `id` into a primary. Returns false if it already was one or is
    /// unknown.
    pub fn set_as_primary(&mut self, id: &NodeId) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) if node.is_replica() => {
                node.role = NodeRole::Primary;
                true
            }
            _ => false,
        }
    }

    /// Turns `id` into a replica of `primary`, dropping any slots it owned.
    pub fn set_as_replica(&mut self, id: &NodeId, primary: Option<NodeId>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.role = NodeRole::Replica { primary };
            node.slots = SlotBitmap::new();
        }
    }

    /// Replaces a provisional handshake record with the peer's real name.
    ///
    /// Returns false, leaving the registry untouched, when `new` is already
    /// known or `old` doesn't exist.
    pub fn rename_node(&mut self, old: &NodeId, new: NodeId) -> bool {
        if self.nodes.contains_key(&new) {
            return false;
        }
        let Some(mut node) = self.nodes.remove(old) else {
            return false;
        };
        info!("renaming handshake node {} to {}", old, new);
        node.id = new;
        node.flags.handshake = false;
        node.flags.meet = false;
        if let Some(link) = node.link.clone() {
            attach_link(&mut node, link);
        }
        self.nodes.insert(new, node);
        true
    }

    /// Removes a node without the administrative checks of [`forget`],
    /// freeing its link. Used for expired handshakes.
    ///
    /// [`forget`]: ClusterState::forget
    pub fn remove_node(&mut self, id: &NodeId) -> Option<ClusterNode> {
        if *id == self.myself {
            return None;
        }
        let mut node = self.nodes.remove(id)?;
        if let Some(link) = node.link.clone() {
            free_link(Some(&link), Some(&mut node));
        }
        for other in self.nodes.values_mut() {
            other.remove_fail_report(*id);
        }
        Some(node)
    }

    /// Administratively removes a node: frees its link, drops its fail
    /// reports and detaches replicas that pointed at it.
    pub fn forget(&mut self, id: &NodeId) -> Result<ClusterNode, ClusterError> {
        if *id == self.myself {
            return Err(ClusterError::CantForgetMyself);
        }
        let node = self
            .remove_node(id)
            .ok_or(ClusterError::NodeNotFound(*id))?;
        for other in self.nodes.values_mut() {
            if other.primary_id() == Some(*id) {
                other.role = NodeRole::Replica { primary: None };
            }
        }
        info!("forgot node {}", id);
        Ok(node)
    }

    /// All primaries, including failing ones.
    pub fn primaries(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes
            .values()
            .filter(|n| n.is_primary() && !n.in_handshake())
    }

    pub fn replicas_of(&self, primary: NodeId) -> impl Iterator<Item = &ClusterNode> {
        self.nodes
            .values()
            .filter(move |n| n.primary_id() == Some(primary))
    }

    /// Number of primaries serving at least one slot.
    pub fn cluster_size(&self) -> usize {
        self.primaries().filter(|n| !n.slots.is_empty()).count()
    }

    /// Majority of [`cluster_size`](ClusterState::cluster_size).
    pub fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Number of peers currently flagged PFAIL.
    pub fn pfail_count(&self) -> usize {
        self.nodes.values().filter(|n| n.flags.pfail).count()
    }

    /// The primary claiming `slot`, if any.
    pub fn slot_owner(&self, slot: u16) -> Option<&ClusterNode> {
        self.nodes
            .values()
            .find(|n| n.is_primary() && n.slots.contains(slot))
    }

    /// The config epoch this node advertises: its own as a primary, its
    /// primary's as a replica.
    pub fn my_config_epoch(&self) -> u64 {
        let me = self.myself();
        match me.primary_id().and_then(|id| self.lookup(&id)) {
            Some(primary) => primary.config_epoch,
            None => me.config_epoch,
        }
    }

    /// Raises the current epoch, never lowering it.
    pub fn observe_epoch(&mut self, epoch: u64) -> bool {
        if epoch > self.current_epoch {
            debug!("current epoch {} -> {}", self.current_epoch, epoch);
            self.current_epoch = epoch;
            true
        } else {
            false
        }
    }

    /// Recomputes health: ok when every slot is owned by a non-FAIL primary.
    pub fn update_health(&mut self) -> ClusterHealth {
        let mut covered = SlotBitmap::new();
        for node in self.primaries().filter(|n| !n.flags.fail) {
            covered.union_with(&node.slots);
        }
        let health = if covered.is_full() {
            ClusterHealth::Ok
        } else {
            ClusterHealth::Fail
        };
        if health != self.health {
            info!("cluster state changed to {}", health);
            self.health = health;
        }
        health
    }

    /// Renders the CLUSTER INFO summary.
    pub fn cluster_info(&self) -> String {
        let mut assigned = SlotBitmap::new();
        let mut pfail = 0;
        let mut fail = 0;
        for node in self.primaries() {
            assigned.union_with(&node.slots);
            if node.flags.fail {
                fail += node.slot_count();
            } else if node.flags.pfail {
                pfail += node.slot_count();
            }
        }
        let assigned = assigned.count();

        format!(
            "cluster_state:{}\r\n\
             cluster_slots_assigned:{}\r\n\
             cluster_slots_ok:{}\r\n\
             cluster_slots_pfail:{}\r\n\
             cluster_slots_fail:{}\r\n\
             cluster_known_nodes:{}\r\n\
             cluster_size:{}\r\n\
             cluster_current_epoch:{}\r\n\
             cluster_my_epoch:{}\r\n",
            self.health,
            assigned,
            assigned.saturating_sub(pfail + fail),
            pfail,
            fail,
            self.nodes.len(),
            self.cluster_size(),
            self.current_epoch,
            self.my_config_epoch(),
        )
    }

    /// Renders the CLUSTER NODES table, one line per node.
    pub fn cluster_nodes(&self) -> String {
        let mut lines: Vec<String> = self
            .nodes
            .values()
            .map(|node| node.to_cluster_nodes_line())
            .collect();
        lines.sort(); // consistent ordering
        lines.join("\n")
    }
}

/// Slots one primary owns in a three-way split of the slot space, for
/// tests that need a healthy cluster.
#[cfg(test)]
pub(crate) fn third(i: u16) -> SlotBitmap {
    use crate::slots::{SlotRange, SLOT_COUNT};
    let size = SLOT_COUNT / 3;
    let start = i * size;
    let end = if i == 2 { SLOT_COUNT - 1 } else { start + size - 1 };
    SlotBitmap::from_ranges(&[SlotRange::new(start, end)])
}
