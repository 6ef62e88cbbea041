//! Heartbeat construction and gossip sampling.
//!
//! Each PING, PONG or MEET mentions a bounded random subset of peers. The
//! protocol version picks the strategy:
//!
//! - **V0** draws peers uniformly at random. The first third of the attempt
//!   budget only accepts peers already flagged PFAIL or FAIL, so failure news
//!   tends to travel first.
//! - **V1** draws only non-PFAIL peers at random, then appends every PFAIL
//!   peer in name order. Every suspected node is mentioned in every
//!   heartbeat, at a cost proportional to the number of suspects.

use rand::prelude::IndexedRandom;
use rand::Rng;

use crate::config::{ClusterConfig, ProtocolVersion};
use crate::header::build_header;
use crate::message::{ClusterMessage, GossipEntry, MessagePayload, MessageType};
use crate::node::ClusterNode;
use crate::state::ClusterState;
use crate::NodeId;

/// How many peers a heartbeat should mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GossipSizing {
    /// Known nodes minus myself and the receiver.
    pub actives: usize,
    /// A tenth of the cluster, at least 3, at most `actives`.
    pub wanted: usize,
}

impl GossipSizing {
    pub fn new(known_nodes: usize) -> Self {
        let actives = known_nodes.saturating_sub(2);
        let wanted = (known_nodes / 10).max(3).min(actives);
        Self { actives, wanted }
    }
}

impl From<&ClusterNode> for GossipEntry {
    fn from(node: &ClusterNode) -> Self {
        GossipEntry {
            node: node.id,
            addr: node.addr,
            bus_port: node.bus_port,
            flags: node.flags,
            is_primary: node.is_primary(),
            ping_sent: node.ping_sent,
            pong_received: node.pong_received,
        }
    }
}

/// Can `node` be mentioned in a gossip section at all?
fn gossipable(node: &ClusterNode) -> bool {
    if node.is_myself() || node.in_handshake() || !node.has_addr() {
        return false;
    }
    // no link and no slots: unreachable and irrelevant
    node.link.is_some() || !node.slots.is_empty()
}

/// Picks the gossip entries for one heartbeat.
pub fn sample_gossip<R: Rng + ?Sized>(
    strategy: ProtocolVersion,
    state: &ClusterState,
    rng: &mut R,
) -> Vec<GossipEntry> {
    let ids = state.node_ids();
    let sizing = GossipSizing::new(ids.len());
    let mut fresh = sizing.actives;
    let mut attempts = sizing.wanted * 3;
    let mut picked: Vec<NodeId> = Vec::with_capacity(sizing.wanted);
    let mut entries = Vec::with_capacity(sizing.wanted);

    while fresh > 0 && entries.len() < sizing.wanted && attempts > 0 {
        attempts -= 1;
        let Some(node) = ids.choose(rng).and_then(|id| state.lookup(id)) else {
            break;
        };

        match strategy {
            ProtocolVersion::V0 => {
                if attempts > sizing.wanted * 2 && !node.is_failing() {
                    continue;
                }
            }
            ProtocolVersion::V1 => {
                if node.flags.pfail {
                    continue;
                }
            }
        }

        if !gossipable(node) || picked.contains(&node.id) {
            continue;
        }

        picked.push(node.id);
        entries.push(GossipEntry::from(node));
        fresh -= 1;
    }

    if strategy == ProtocolVersion::V1 {
        let pfail_wanted = state.pfail_count();
        let mut appended = 0;
        for node in state.nodes() {
            if appended >= pfail_wanted {
                break;
            }
            if node.in_handshake() || !node.has_addr() || !node.flags.pfail {
                continue;
            }
            entries.push(GossipEntry::from(node));
            appended += 1;
        }
    }

    entries
}

/// Builds a PING, PONG or MEET with a sampled gossip section.
///
/// A PING to `target` records the send time on the target first; that
/// timestamp is what the failure detector measures timeouts against.
pub fn build_heartbeat<R: Rng + ?Sized>(
    state: &mut ClusterState,
    config: &ClusterConfig,
    kind: MessageType,
    target: Option<NodeId>,
    now: u64,
    replication_offset: u64,
    rng: &mut R,
) -> ClusterMessage {
    debug_assert!(kind.carries_gossip());
    if kind == MessageType::Ping {
        if let Some(node) = target.and_then(|id| state.lookup_mut(&id)) {
            node.ping_sent = now;
        }
    }
    let entries = sample_gossip(config.protocol_version, state, rng);
    ClusterMessage {
        payload: MessagePayload::Gossip(entries),
        ..build_header(state, config, kind, replication_offset)
    }
}
