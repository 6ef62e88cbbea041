//! Slot ownership conflict resolution.
//!
//! Ownership of a slot follows the highest config epoch claiming it. Claims
//! arrive from heartbeat headers and from UPDATE messages; a claim with an
//! older epoch than the current owner's is answered with an UPDATE so the
//! sender learns the newer config.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::events::{ClusterEvent, Context, Effects};
use crate::header::update_message;
use crate::link::Link;
use crate::message::ClusterMessage;
use crate::slots::SlotBitmap;
use crate::state::ClusterState;
use crate::NodeId;

/// Applies an UPDATE: `node` owns exactly `slots` as of `config_epoch`.
///
/// Stale or unresolvable updates are ignored. Returns true if anything
/// changed.
pub fn handle_update(
    state: &mut ClusterState,
    sender: NodeId,
    node: NodeId,
    config_epoch: u64,
    slots: &SlotBitmap,
    fx: &mut Effects,
) -> bool {
    if state.lookup(&sender).is_none() {
        debug!("ignoring UPDATE from unknown sender {}", sender);
        return false;
    }
    let Some(current) = state.lookup(&node) else {
        debug!("ignoring UPDATE about unknown node {}", node);
        return false;
    };
    if current.config_epoch >= config_epoch {
        debug!(
            "ignoring stale UPDATE about {} (epoch {} <= {})",
            node, config_epoch, current.config_epoch
        );
        return false;
    }

    if state.set_as_primary(&node) {
        info!("node {} is now a primary according to an UPDATE", node);
    }
    if let Some(current) = state.lookup_mut(&node) {
        current.config_epoch = config_epoch;
    }
    update_slots_config_with(state, node, config_epoch, slots, fx);

    // drop whatever the update no longer lists
    if let Some(current) = state.lookup_mut(&node) {
        let extra: Vec<u16> = current.slots.iter().filter(|s| !slots.contains(*s)).collect();
        for slot in extra {
            current.slots.clear(slot);
        }
    }
    state.update_health();
    true
}

/// Moves every slot in `claimed` to `owner` where the current owner has an
/// older config epoch.
///
/// If the primary this node belongs to (itself, or the one it replicates)
/// loses its last slot this way, this node starts replicating `owner`.
pub fn update_slots_config_with(
    state: &mut ClusterState,
    owner: NodeId,
    config_epoch: u64,
    claimed: &SlotBitmap,
    fx: &mut Effects,
) {
    let myself = state.myself_id();
    let my_primary = if state.myself().is_primary() {
        Some(myself)
    } else {
        state.myself().primary_id()
    };

    let mut moved = Vec::new();
    let mut my_primary_lost = false;
    for slot in claimed.iter() {
        let current = state.slot_owner(slot).map(|n| (n.id, n.config_epoch));
        match current {
            Some((id, _)) if id == owner => continue,
            Some((_, epoch)) if epoch >= config_epoch => continue,
            _ => {}
        }
        if let Some((previous, _)) = current {
            if Some(previous) == my_primary {
                my_primary_lost = true;
            }
            if let Some(prev) = state.lookup_mut(&previous) {
                prev.slots.clear(slot);
            }
        }
        moved.push(slot);
    }
    if moved.is_empty() {
        return;
    }

    let Some(node) = state.lookup_mut(&owner) else {
        return;
    };
    for slot in &moved {
        node.slots.set(*slot);
    }
    debug!(
        "{} slots now owned by {} at config epoch {}",
        moved.len(),
        owner,
        config_epoch
    );
    fx.event(ClusterEvent::SlotsChanged(owner, node.slots.ranges()));

    let emptied = my_primary
        .and_then(|id| state.lookup(&id))
        .is_some_and(|p| p.slots.is_empty());
    if my_primary_lost && emptied && owner != myself {
        warn!("configuration change detected: reconfiguring myself as a replica of {owner}");
        state.set_as_replica(&myself, Some(owner));
        state.failover = Default::default();
        fx.event(ClusterEvent::BecameReplica(owner));
    }
    state.update_health();
}

/// Reconciles the slots a heartbeat claims with our view.
///
/// A primary sender's newer claims are applied. Claims on slots we know a
/// newer owner for are answered with an UPDATE over `reply_to`.
pub fn handle_slot_claims(
    state: &mut ClusterState,
    ctx: &Context<'_>,
    msg: &ClusterMessage,
    reply_to: &Arc<Link>,
    fx: &mut Effects,
) {
    let claimer = if msg.sender_is_primary() {
        Some(msg.sender)
    } else {
        msg.primary()
    };
    let Some(claimer) = claimer else {
        return;
    };
    let dirty = match state.lookup(&claimer) {
        Some(node) => node.slots != msg.slots,
        None => return,
    };
    if !dirty {
        return;
    }

    if msg.sender_is_primary() {
        update_slots_config_with(state, claimer, msg.config_epoch, &msg.slots, fx);
    }

    for slot in msg.slots.iter() {
        let Some(owner) = state.slot_owner(slot) else {
            continue;
        };
        if owner.id != claimer && owner.config_epoch > msg.config_epoch {
            debug!(
                "node {} has an old slots configuration, sending an UPDATE about {}",
                msg.sender, owner.id
            );
            let update = update_message(state, ctx.config, owner, ctx.replication_offset);
            fx.send(reply_to, update);
            break;
        }
    }
}

/// Two primaries with the same config epoch: the one with the smaller name
/// takes a new, unique epoch.
pub fn handle_config_epoch_collision(state: &mut ClusterState, sender: NodeId) -> bool {
    let me = state.myself();
    let Some(other) = state.lookup(&sender) else {
        return false;
    };
    if !me.is_primary() || !other.is_primary() || other.config_epoch != me.config_epoch {
        return false;
    }
    // the peer with the smaller name bumps
    if sender <= me.id {
        return false;
    }
    state.current_epoch += 1;
    let epoch = state.current_epoch;
    state.myself_mut().config_epoch = epoch;
    warn!("config epoch collision with {sender}: my config epoch is now {epoch}");
    true
}
