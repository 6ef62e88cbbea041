//! watchdog-cluster: gossip bus, failure detection and failover election.
//!
//! Nodes of a sharded key-value service exchange heartbeats over
//! persistent point-to-point links. Each heartbeat describes the sender and
//! a sample of the peers it knows, which is enough for every node to notice
//! failures without a coordinator and to agree on who owns which of the
//! 16384 hash slots.
//!
//! # Architecture
//!
//! - **Registry** ([`ClusterState`]): every known node, keyed by name, plus
//!   the cluster-wide epochs
//! - **Links** ([`Link`], [`Transport`]): one logical connection per peer
//! - **Messages** ([`ClusterMessage`]): header, typed payload and codec
//! - **Gossip sampling**: which peers each heartbeat mentions, V0 or V1
//! - **Failure detection**: PFAIL on a missed PONG, FAIL on a quorum
//! - **Failover**: replicas of a FAIL primary run an epoch-numbered vote
//! - **Conflict resolution**: the highest config epoch owns a slot
//!
//! The engine itself is synchronous. [`ClusterBus`] wraps it in a single
//! lock and sends whatever it produces in the background.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use watchdog_cluster::{ClusterBus, ClusterConfig, ClusterNode, NodeId};
//!
//! let config = ClusterConfig::default();
//! let me = ClusterNode::new_primary(NodeId::new(), config.announce_addr(), config.announce_bus_port);
//! let bus = ClusterBus::new(config, me, None)?;
//! bus.meet("10.0.0.2:6379".parse()?, 16379).await;
//! bus.tick().await;
//! ```

mod bus;
mod config;
mod election;
mod error;
mod events;
mod failure;
mod gossip;
mod header;
pub mod link;
mod message;
mod node;
mod sampler;
mod slots;
mod state;
mod stats;
pub mod time;
mod update;

pub use bus::ClusterBus;
pub use config::{ClusterConfig, ProtocolVersion};
pub use election::{Election, FailoverState};
pub use error::ClusterError;
pub use events::{ClusterEvent, Context, Effects};
pub use header::{build_header, ReplicationOffset, StaticOffset};
pub use link::{create_link, free_link, Link, Transport};
pub use message::{
    ClusterHealth, ClusterMessage, GossipEntry, MessagePayload, MessageType, MAX_GOSSIP_ENTRIES,
    SIGNATURE,
};
pub use node::{ClusterNode, FailReport, NodeFlags, NodeId, NodeRole};
pub use sampler::{build_heartbeat, sample_gossip, GossipSizing};
pub use slots::{SlotBitmap, SlotRange, SLOT_COUNT};
pub use state::ClusterState;
pub use stats::{BusStats, BusStatsSnapshot};
