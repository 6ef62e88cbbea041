//! Per-node state: identity, role, flags, slots, epochs and fail reports.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::link::Link;
use crate::slots::SlotBitmap;
use crate::time::NEVER;

/// Unique identifier for a cluster node.
///
/// Wraps a UUID v4, assigned once when a node is created and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generates a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a node ID from a UUID string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability (similar to git short hashes)
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// The role of a node in the cluster.
///
/// A node is either a primary or a replica, never both. A replica refers to
/// its primary by ID only; the primary record is re-resolved through the
/// registry on every use, so forgetting it can't leave a dangling reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Owns slots and votes in failover elections.
    Primary,
    /// Mirrors a primary. `primary` is `None` until the primary is known.
    Replica { primary: Option<NodeId> },
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "master"),
            NodeRole::Replica { .. } => write!(f, "slave"),
        }
    }
}

/// Status flags for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags {
    /// Node is the local node (myself).
    pub myself: bool,
    /// Node is suspected to be failing (no PONG within the node timeout).
    pub pfail: bool,
    /// Node has been confirmed as failed by the cluster.
    pub fail: bool,
    /// Node is performing a handshake (identity not yet confirmed).
    pub handshake: bool,
    /// Node has no address yet.
    pub noaddr: bool,
    /// A MEET must be sent instead of a PING on the next heartbeat.
    pub meet: bool,
    /// We granted a failover vote for one of this primary's replicas.
    pub failover_auth: bool,
}

impl std::fmt::Display for NodeFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut flags = Vec::new();
        if self.myself {
            flags.push("myself");
        }
        if self.pfail {
            flags.push("pfail");
        }
        if self.fail {
            flags.push("fail");
        }
        if self.handshake {
            flags.push("handshake");
        }
        if self.noaddr {
            flags.push("noaddr");
        }
        if self.meet {
            flags.push("meet");
        }
        if self.failover_auth {
            flags.push("failover_auth");
        }
        if flags.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", flags.join(","))
        }
    }
}

/// One peer's claim that a node is failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailReport {
    pub reporter: NodeId,
    /// When the claim was last refreshed, in unix millis.
    pub time: u64,
}

/// Information about a single node in the cluster.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    /// Unique node identifier.
    pub id: NodeId,
    /// Address for client connections.
    pub addr: SocketAddr,
    /// Port for cluster bus (gossip) connections.
    pub bus_port: u16,
    /// Node's role in the cluster.
    pub role: NodeRole,
    /// Status flags.
    pub flags: NodeFlags,
    /// Slots owned by this node. Always empty for replicas.
    pub slots: SlotBitmap,
    /// Version of this node's slot assignment. Never decreases.
    pub config_epoch: u64,
    /// When the node record was created.
    pub created: u64,
    /// When we last sent a PING still awaiting its PONG, or `NEVER`.
    pub ping_sent: u64,
    /// When we last received a PONG from this node.
    pub pong_received: u64,
    /// When the node was flagged FAIL.
    pub fail_time: u64,
    /// When we last voted for one of this primary's replicas.
    pub voted_time: u64,
    /// Last replication offset advertised (replicas only).
    pub repl_offset: u64,
    /// Recent claims from other primaries that this node is failing.
    pub fail_reports: Vec<FailReport>,
    /// The live bus connection to this node, if any.
    pub link: Option<Arc<Link>>,
}

impl ClusterNode {
    /// Creates a new primary node with no slots.
    pub fn new_primary(id: NodeId, addr: SocketAddr, bus_port: u16) -> Self {
        Self {
            id,
            addr,
            bus_port,
            role: NodeRole::Primary,
            flags: NodeFlags::default(),
            slots: SlotBitmap::new(),
            config_epoch: 0,
            created: crate::time::now_ms(),
            ping_sent: NEVER,
            pong_received: NEVER,
            fail_time: NEVER,
            voted_time: NEVER,
            repl_offset: 0,
            fail_reports: Vec::new(),
            link: None,
        }
    }

    /// Creates a new replica node.
    pub fn new_replica(id: NodeId, addr: SocketAddr, bus_port: u16, primary: NodeId) -> Self {
        Self {
            role: NodeRole::Replica {
                primary: Some(primary),
            },
            ..Self::new_primary(id, addr, bus_port)
        }
    }

    /// Creates a provisional record for a peer we are about to MEET.
    ///
    /// The random ID is replaced with the peer's real one when its first
    /// PONG arrives.
    pub fn new_handshake(addr: SocketAddr, bus_port: u16) -> Self {
        let mut node = Self::new_primary(NodeId::new(), addr, bus_port);
        node.flags.handshake = true;
        node.flags.meet = true;
        node
    }

    /// Marks this node as the local node.
    pub fn set_myself(&mut self) {
        self.flags.myself = true;
    }

    pub fn is_myself(&self) -> bool {
        self.flags.myself
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }

    pub fn is_replica(&self) -> bool {
        matches!(self.role, NodeRole::Replica { .. })
    }

    /// The primary this node replicates, if it is a replica of a known node.
    pub fn primary_id(&self) -> Option<NodeId> {
        match self.role {
            NodeRole::Replica { primary } => primary,
            NodeRole::Primary => None,
        }
    }

    pub fn in_handshake(&self) -> bool {
        self.flags.handshake
    }

    pub fn has_addr(&self) -> bool {
        !self.flags.noaddr
    }

    /// True when the node is PFAIL or FAIL.
    pub fn is_failing(&self) -> bool {
        self.flags.pfail || self.flags.fail
    }

    /// Returns the total number of slots owned by this node.
    pub fn slot_count(&self) -> usize {
        self.slots.count()
    }

    /// Address of this node's cluster bus endpoint.
    pub fn cluster_bus_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr.ip(), self.bus_port)
    }

    /// Adds or refreshes a fail report from `reporter`.
    ///
    /// Returns true when the report is new rather than a refresh.
    pub fn add_fail_report(&mut self, reporter: NodeId, now: u64) -> bool {
        if let Some(report) = self.fail_reports.iter_mut().find(|r| r.reporter == reporter) {
            report.time = now;
            return false;
        }
        self.fail_reports.push(FailReport {
            reporter,
            time: now,
        });
        true
    }

    /// Removes the fail report from `reporter`. Returns true if one existed.
    pub fn remove_fail_report(&mut self, reporter: NodeId) -> bool {
        let before = self.fail_reports.len();
        self.fail_reports.retain(|r| r.reporter != reporter);
        self.fail_reports.len() != before
    }

    /// Drops reports older than `validity_ms`.
    pub fn prune_fail_reports(&mut self, now: u64, validity_ms: u64) {
        self.fail_reports
            .retain(|r| now.saturating_sub(r.time) <= validity_ms);
    }

    /// Formats the node in CLUSTER NODES output format.
    pub fn to_cluster_nodes_line(&self) -> String {
        let slots_str = self
            .slots
            .ranges()
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(" ");

        let primary_str = self
            .primary_id()
            .map(|id| id.0.to_string())
            .unwrap_or_else(|| "-".to_string());

        let link_state = if self.link.is_some() || self.is_myself() {
            "connected"
        } else {
            "disconnected"
        };

        // Format: <id> <addr>@<bus-port> <flags> <master-id> <ping-sent> <pong-recv> <config-epoch> <link-state> <slots>
        format!(
            "{} {}@{} {} {} {} {} {} {} {}",
            self.id.0,
            self.addr,
            self.bus_port,
            self.format_flags(),
            primary_str,
            self.ping_sent,
            self.pong_received,
            self.config_epoch,
            link_state,
            slots_str
        )
        .trim()
        .to_string()
    }

    fn format_flags(&self) -> String {
        let mut flags = Vec::new();

        if self.flags.myself {
            flags.push("myself");
        }

        match self.role {
            NodeRole::Primary => flags.push("master"),
            NodeRole::Replica { .. } => flags.push("slave"),
        }

        if self.flags.fail {
            flags.push("fail");
        } else if self.flags.pfail {
            flags.push("fail?");
        }

        if self.flags.handshake {
            flags.push("handshake");
        }

        if self.flags.noaddr {
            flags.push("noaddr");
        }

        flags.join(",")
    }
}
