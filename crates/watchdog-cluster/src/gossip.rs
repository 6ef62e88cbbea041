//! Inbound message dispatch and the periodic cron.
//!
//! # Message handling
//!
//! Every message first resolves its sender against the registry. Unknown
//! senders are mostly ignored: a MEET adds the sender, a PING is answered
//! without adding anything, and a PONG arriving on a handshake link names
//! the provisional record after the peer. Known senders then have their
//! epochs, role and slot claims reconciled, and their gossip section
//! feeds the failure detector and node discovery.
//!
//! # Cron
//!
//! Each tick expires stale handshakes, pings a few peers, drops links that
//! stopped answering, runs the failure detector and, on replicas, the
//! failover election.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::prelude::IndexedRandom;
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::election;
use crate::events::{ClusterEvent, Context, Effects};
use crate::failure;
use crate::link::{attach_link, create_link, free_link, Link, Transport};
use crate::message::{ClusterMessage, GossipEntry, MessagePayload, MessageType};
use crate::node::{ClusterNode, NodeRole};
use crate::sampler::build_heartbeat;
use crate::state::ClusterState;
use crate::time::{elapsed_since, millis, NEVER};
use crate::update;
use crate::NodeId;

/// Shortest lifetime of a provisional handshake record.
const MIN_HANDSHAKE_TIMEOUT_MS: u64 = 1000;
/// Random peers the once-a-second ping picks among.
const PING_CANDIDATES: usize = 5;
/// Gossiped pong times this far ahead of our clock are still accepted.
const PONG_CLOCK_SKEW_MS: u64 = 500;

/// Processes one message received on `link`.
pub fn process_message<R: Rng + ?Sized>(
    state: &mut ClusterState,
    ctx: &Context<'_>,
    link: &Arc<Link>,
    msg: &ClusterMessage,
    rng: &mut R,
    fx: &mut Effects,
) {
    if msg.sender == state.myself_id() {
        trace!("dropping a message carrying my own name");
        return;
    }
    trace!("{} received from {} on link {}", msg.kind, msg.sender, link.id());

    match msg.kind {
        MessageType::Meet if state.lookup(&msg.sender).is_none() => {
            add_met_node(state, link, msg, fx);
        }
        MessageType::Pong => resolve_handshake(state, link, msg, fx),
        _ => {}
    }

    if matches!(msg.kind, MessageType::Ping | MessageType::Meet) {
        let pong = build_heartbeat(
            state,
            ctx.config,
            MessageType::Pong,
            None,
            ctx.now,
            ctx.replication_offset,
            rng,
        );
        fx.send(link, pong);
    }

    let known = state
        .lookup(&msg.sender)
        .is_some_and(|n| !n.in_handshake());
    if !known {
        debug!("ignoring {} from unknown node {}", msg.kind, msg.sender);
        return;
    }
    adopt_sender_header(state, link, msg);

    match msg.kind {
        MessageType::Ping | MessageType::Pong | MessageType::Meet => {
            if msg.kind == MessageType::Pong && link.node() == Some(msg.sender) {
                failure::handle_pong(state, ctx, msg.sender, fx);
            }
            apply_sender_role(state, msg, fx);
            update::handle_slot_claims(state, ctx, msg, link, fx);
            update::handle_config_epoch_collision(state, msg.sender);
            process_gossip(state, ctx, msg.sender, msg.gossip(), fx);
        }
        MessageType::Fail => {
            if let MessagePayload::Fail { node } = &msg.payload {
                failure::handle_fail(state, msg.sender, *node, ctx.now, fx);
            }
        }
        MessageType::Update => {
            if let MessagePayload::Update {
                node,
                config_epoch,
                slots,
            } = &msg.payload
            {
                update::handle_update(state, msg.sender, *node, *config_epoch, slots, fx);
            }
        }
        MessageType::FailoverAuthRequest => {
            election::handle_auth_request(state, ctx, msg, link, fx);
        }
        MessageType::FailoverAuthAck => {
            election::handle_auth_ack(state, ctx, msg.sender, msg.current_epoch, rng, fx);
        }
    }
    state.update_health();
}

/// Adds the sender of a MEET, binding the link it arrived on.
fn add_met_node(state: &mut ClusterState, link: &Arc<Link>, msg: &ClusterMessage, fx: &mut Effects) {
    let mut node = ClusterNode::new_primary(msg.sender, msg.addr, msg.bus_port);
    node.role = msg.role;
    if link.node().is_none() && !link.is_closed() {
        attach_link(&mut node, Arc::clone(link));
    }
    if state.upsert(node) {
        info!("node {} met us from {}", msg.sender, msg.addr);
        fx.event(ClusterEvent::NodeAdded(msg.sender, msg.addr));
    }
}

/// Resolves the node behind `link` against the name a PONG carries.
///
/// A handshake record takes the peer's real name, or is dropped if that
/// name is already known. A regular record answering under a different
/// name means another node now lives at that address, so the link is
/// dropped and the old record loses its address.
fn resolve_handshake(
    state: &mut ClusterState,
    link: &Arc<Link>,
    msg: &ClusterMessage,
    fx: &mut Effects,
) {
    let Some(bound) = link.node() else {
        return;
    };
    if bound == msg.sender {
        return;
    }
    let Some(node) = state.lookup(&bound) else {
        return;
    };

    if !node.in_handshake() {
        warn!(
            "PONG from {} carries name {}: the node at this address changed, dropping the link",
            bound, msg.sender
        );
        if let Some(node) = state.lookup_mut(&bound) {
            node.flags.noaddr = true;
            free_link(Some(link), Some(node));
        }
        return;
    }

    let addr = node.addr;
    if state.lookup(&msg.sender).is_some() {
        debug!(
            "handshake with {} completed, but {} is already known",
            addr, msg.sender
        );
        state.remove_node(&bound);
        return;
    }
    if state.rename_node(&bound, msg.sender) {
        if let Some(node) = state.lookup_mut(&msg.sender) {
            node.role = msg.role;
        }
        fx.event(ClusterEvent::NodeAdded(msg.sender, addr));
    }
}

/// Takes in what a known sender's header says about itself: epochs, the
/// replication offset, and an inbound link if it has none yet.
fn adopt_sender_header(state: &mut ClusterState, link: &Arc<Link>, msg: &ClusterMessage) {
    state.observe_epoch(msg.current_epoch);
    let Some(node) = state.lookup_mut(&msg.sender) else {
        return;
    };
    if msg.sender_is_primary() {
        if msg.config_epoch > node.config_epoch {
            debug!(
                "config epoch of {} raised {} -> {}",
                node.id, node.config_epoch, msg.config_epoch
            );
            node.config_epoch = msg.config_epoch;
        }
    } else {
        node.repl_offset = msg.offset;
    }
    if node.link.is_none() && link.node().is_none() && !link.is_closed() {
        attach_link(node, Arc::clone(link));
    }
}

/// Brings the sender's role in line with its header.
fn apply_sender_role(state: &mut ClusterState, msg: &ClusterMessage, fx: &mut Effects) {
    let Some(node) = state.lookup(&msg.sender) else {
        return;
    };
    match msg.role {
        NodeRole::Primary => {
            if state.set_as_primary(&msg.sender) {
                info!("node {} is now a primary", msg.sender);
            }
        }
        NodeRole::Replica { primary } => {
            if node.role == msg.role {
                return;
            }
            let had_slots = !node.slots.is_empty();
            if node.is_primary() {
                info!("primary {} reconfigured as a replica", msg.sender);
            }
            state.set_as_replica(&msg.sender, primary);
            if had_slots {
                fx.event(ClusterEvent::SlotsChanged(msg.sender, Vec::new()));
            }
        }
    }
}

/// Walks the gossip section of a message from a known sender.
fn process_gossip(
    state: &mut ClusterState,
    ctx: &Context<'_>,
    sender: NodeId,
    entries: &[GossipEntry],
    fx: &mut Effects,
) {
    let me = state.myself_id();
    for entry in entries {
        if entry.node == me {
            continue;
        }
        let failing = entry.flags.pfail || entry.flags.fail;

        if state.lookup(&entry.node).is_none() {
            if !entry.flags.noaddr && !entry.flags.handshake {
                if let Some(provisional) = start_handshake(state, entry.addr, entry.bus_port) {
                    debug!(
                        "{} gossiped unknown node {}, handshaking with {} as {}",
                        sender, entry.node, entry.addr, provisional
                    );
                }
            }
            continue;
        }

        failure::record_gossip_opinion(state, ctx, sender, entry.node, failing, fx);

        let Some(node) = state.lookup_mut(&entry.node) else {
            continue;
        };
        // a peer heard from this node more recently than we did
        if !failing
            && node.ping_sent == NEVER
            && node.fail_reports.is_empty()
            && entry.pong_received > node.pong_received
            && entry.pong_received <= ctx.now + PONG_CLOCK_SKEW_MS
        {
            node.pong_received = entry.pong_received;
        }

        let gossiped_bus = SocketAddr::new(entry.addr.ip(), entry.bus_port);
        if !failing
            && !entry.flags.noaddr
            && node.link.is_none()
            && (node.flags.noaddr || node.is_failing())
            && node.cluster_bus_addr() != gossiped_bus
        {
            info!("address of node {} updated to {} by gossip", node.id, entry.addr);
            node.addr = entry.addr;
            node.bus_port = entry.bus_port;
            node.flags.noaddr = false;
        }
    }
}

/// Registers a provisional HANDSHAKE+MEET record for the node at `addr`.
///
/// Returns its provisional name, or `None` if the address is unusable or a
/// handshake with the same bus endpoint is already in progress.
pub fn start_handshake(state: &mut ClusterState, addr: SocketAddr, bus_port: u16) -> Option<NodeId> {
    if addr.port() == 0 || bus_port == 0 || addr.ip().is_unspecified() {
        return None;
    }
    let bus_addr = SocketAddr::new(addr.ip(), bus_port);
    if state
        .nodes()
        .any(|n| n.in_handshake() && n.cluster_bus_addr() == bus_addr)
    {
        return None;
    }
    let node = ClusterNode::new_handshake(addr, bus_port);
    let id = node.id;
    state.upsert(node);
    Some(id)
}

/// Binds a fresh link over `transport` to `id` and greets the peer with a
/// MEET (for a pending handshake) or a PING.
///
/// A ping already in flight keeps its original send time, so reconnecting
/// doesn't restart the failure timer.
pub fn connect_node<R: Rng + ?Sized>(
    state: &mut ClusterState,
    ctx: &Context<'_>,
    id: NodeId,
    transport: Arc<dyn Transport>,
    rng: &mut R,
    fx: &mut Effects,
) -> Option<Arc<Link>> {
    let node = state.lookup_mut(&id)?;
    if node.is_myself() {
        return None;
    }
    let old_ping_sent = node.ping_sent;
    let kind = if node.flags.meet {
        MessageType::Meet
    } else {
        MessageType::Ping
    };
    let link = create_link(node, transport);

    let greeting = build_heartbeat(
        state,
        ctx.config,
        kind,
        Some(id),
        ctx.now,
        ctx.replication_offset,
        rng,
    );
    if let Some(node) = state.lookup_mut(&id) {
        if old_ping_sent != NEVER {
            node.ping_sent = old_ping_sent;
        }
        node.flags.meet = false;
    }
    debug!("link {} connected to node {}, sent {}", link.id(), id, kind);
    fx.send(&link, greeting);
    Some(link)
}

/// Releases a link whose transport went away.
pub fn link_closed(state: &mut ClusterState, link: &Arc<Link>) {
    let node = link.node().and_then(|id| state.lookup_mut(&id));
    free_link(Some(link), node);
}

/// Nodes the connection manager should open a link to.
pub fn nodes_needing_link(state: &ClusterState) -> Vec<(NodeId, SocketAddr)> {
    state
        .nodes()
        .filter(|n| !n.is_myself() && n.has_addr() && n.link.is_none())
        .map(|n| (n.id, n.cluster_bus_addr()))
        .collect()
}

/// Runs one tick of the cluster cron. `tick` counts calls since startup.
pub fn cron<R: Rng + ?Sized>(
    state: &mut ClusterState,
    ctx: &Context<'_>,
    tick: u64,
    rng: &mut R,
    fx: &mut Effects,
) {
    let timeout = ctx.config.node_timeout_ms();
    expire_handshakes(state, ctx.now, timeout.max(MIN_HANDSHAKE_TIMEOUT_MS));

    let ticks_per_second = (1000 / millis(ctx.config.tick_interval).max(1)).max(1);
    if tick % ticks_per_second == 0 {
        if let Some(id) = pick_ping_target(state, rng) {
            ping(state, ctx, id, rng, fx);
        }
    }

    let mut overdue = Vec::new();
    let mut stalled = Vec::new();
    for node in state.nodes_mut() {
        if node.is_myself() || node.in_handshake() || !node.has_addr() {
            continue;
        }
        let Some(link) = &node.link else {
            // unreachable nodes still have to time out
            if node.ping_sent == NEVER {
                node.ping_sent = ctx.now;
            }
            continue;
        };
        let link_age = ctx.now.saturating_sub(link.created());
        let ping_delay = elapsed_since(node.ping_sent, ctx.now);
        if link_age > timeout && ping_delay.is_some_and(|d| d > timeout / 2) {
            stalled.push(node.id);
        } else if node.ping_sent == NEVER
            && ctx.now.saturating_sub(node.pong_received) > timeout / 2
        {
            overdue.push(node.id);
        }
    }

    for id in stalled {
        if let Some(node) = state.lookup_mut(&id) {
            debug!("link to node {} stalled, reconnecting", id);
            let link = node.link.clone();
            free_link(link.as_ref(), Some(node));
        }
    }
    for id in overdue {
        ping(state, ctx, id, rng, fx);
    }

    failure::check_timeouts(state, ctx, fx);
    if state.myself().is_replica() {
        election::handle_replica_failover(state, ctx, rng, fx);
    }
    state.update_health();
}

fn expire_handshakes(state: &mut ClusterState, now: u64, limit: u64) {
    let expired: Vec<NodeId> = state
        .nodes()
        .filter(|n| n.in_handshake() && now.saturating_sub(n.created) > limit)
        .map(|n| n.id)
        .collect();
    for id in expired {
        if let Some(node) = state.remove_node(&id) {
            debug!("handshake with {} timed out", node.cluster_bus_addr());
        }
    }
}

/// The linked peer with the oldest PONG among a few random candidates.
fn pick_ping_target<R: Rng + ?Sized>(state: &ClusterState, rng: &mut R) -> Option<NodeId> {
    let candidates: Vec<&ClusterNode> = state
        .nodes()
        .filter(|n| {
            !n.is_myself() && !n.in_handshake() && n.link.is_some() && n.ping_sent == NEVER
        })
        .collect();
    candidates
        .choose_multiple(rng, PING_CANDIDATES)
        .min_by_key(|n| n.pong_received)
        .map(|n| n.id)
}

fn ping<R: Rng + ?Sized>(
    state: &mut ClusterState,
    ctx: &Context<'_>,
    id: NodeId,
    rng: &mut R,
    fx: &mut Effects,
) {
    let Some(link) = state.lookup(&id).and_then(|n| n.link.clone()) else {
        return;
    };
    let msg = build_heartbeat(
        state,
        ctx.config,
        MessageType::Ping,
        Some(id),
        ctx.now,
        ctx.replication_offset,
        rng,
    );
    fx.send(&link, msg);
}
