//! Outgoing message headers.
//!
//! Every builder here only reads the registry. Calling one any number of
//! times has no effect on cluster state.

use crate::config::ClusterConfig;
use crate::message::{ClusterMessage, MessagePayload, MessageType};
use crate::node::ClusterNode;
use crate::state::ClusterState;
use crate::NodeId;

/// Source of the local replication offset.
///
/// Only consulted while this node is a replica; primaries always advertise
/// zero.
pub trait ReplicationOffset: Send + Sync {
    fn replication_offset(&self) -> u64;
}

/// Reports a fixed offset. Useful for nodes that don't replicate data.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticOffset(pub u64);

impl ReplicationOffset for StaticOffset {
    fn replication_offset(&self) -> u64 {
        self.0
    }
}

/// Builds a header of type `kind` describing this node, with an empty
/// payload.
///
/// A replica speaks for its primary's slots and config epoch, names that
/// primary, and carries `replication_offset`.
pub fn build_header(
    state: &ClusterState,
    config: &ClusterConfig,
    kind: MessageType,
    replication_offset: u64,
) -> ClusterMessage {
    let me = state.myself();
    let primary = me.primary_id().and_then(|id| state.lookup(&id));
    let slots = match (me.is_replica(), primary) {
        (true, Some(primary)) => primary.slots.clone(),
        _ => me.slots.clone(),
    };

    ClusterMessage {
        version: config.protocol_version,
        kind,
        sender: me.id,
        addr: config.announce_addr(),
        bus_port: config.announce_bus_port,
        flags: me.flags,
        role: me.role,
        state: state.health,
        slots,
        current_epoch: state.current_epoch,
        config_epoch: state.my_config_epoch(),
        offset: if me.is_replica() { replication_offset } else { 0 },
        payload: MessagePayload::Empty,
    }
}

/// A FAIL announcement for `node`.
pub fn fail_message(
    state: &ClusterState,
    config: &ClusterConfig,
    node: NodeId,
    replication_offset: u64,
) -> ClusterMessage {
    ClusterMessage {
        payload: MessagePayload::Fail { node },
        ..build_header(state, config, MessageType::Fail, replication_offset)
    }
}

/// An UPDATE describing `owner`'s current slots and config epoch.
pub fn update_message(
    state: &ClusterState,
    config: &ClusterConfig,
    owner: &ClusterNode,
    replication_offset: u64,
) -> ClusterMessage {
    ClusterMessage {
        payload: MessagePayload::Update {
            node: owner.id,
            config_epoch: owner.config_epoch,
            slots: owner.slots.clone(),
        },
        ..build_header(state, config, MessageType::Update, replication_offset)
    }
}
