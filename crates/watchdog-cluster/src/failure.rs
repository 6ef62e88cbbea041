//! PFAIL / FAIL state machine.
//!
//! A peer moves REACHABLE → PFAIL when its PONG is overdue, and PFAIL → FAIL
//! either when it stays silent past the local hard deadline or when a
//! majority of slot-owning primaries corroborate the suspicion within the
//! report validity window. FAIL is only reached from PFAIL (or from a FAIL
//! announcement by a peer that reached it that way) and is broadcast to every
//! linked peer as soon as it is reached.

use tracing::{debug, info, warn};

use crate::events::{ClusterEvent, Context, Effects};
use crate::header::fail_message;
use crate::state::ClusterState;
use crate::time::{elapsed_since, NEVER};
use crate::NodeId;

/// Flags every overdue peer PFAIL and promotes suspects to FAIL where
/// the local deadline or the report quorum allows it.
pub fn check_timeouts(state: &mut ClusterState, ctx: &Context<'_>, fx: &mut Effects) {
    let timeout = ctx.config.node_timeout_ms();
    let confirm = ctx.config.fail_confirm_ms();
    let mut suspects = Vec::new();

    for node in state.nodes_mut() {
        if node.is_myself() || node.in_handshake() || !node.has_addr() {
            continue;
        }
        let Some(waited) = elapsed_since(node.ping_sent, ctx.now) else {
            continue;
        };
        if waited > timeout && !node.is_failing() {
            node.flags.pfail = true;
            warn!("*** node {} possibly failing (no pong for {waited}ms)", node.id);
            fx.event(ClusterEvent::NodeSuspected(node.id));
        }
        if node.flags.pfail && !node.flags.fail {
            let hard_deadline = confirm.is_some_and(|limit| waited > limit);
            suspects.push((node.id, hard_deadline));
        }
    }

    for (id, hard_deadline) in suspects {
        if hard_deadline {
            info!("node {} unreachable past the local deadline", id);
            mark_failed(state, ctx, id, fx);
        } else {
            mark_failing_if_needed(state, ctx, id, fx);
        }
    }
}

/// Promotes `id` from PFAIL to FAIL when enough primaries agree.
///
/// Stale reports are pruned first. Our own suspicion counts when we are a
/// primary. Returns true if the node was failed by this call.
pub fn mark_failing_if_needed(
    state: &mut ClusterState,
    ctx: &Context<'_>,
    id: NodeId,
    fx: &mut Effects,
) -> bool {
    let needed = state.quorum();
    let myself_votes = usize::from(state.myself().is_primary());
    let validity = ctx.config.fail_report_validity_ms();

    let Some(node) = state.lookup_mut(&id) else {
        return false;
    };
    if node.is_myself() || !node.flags.pfail || node.flags.fail {
        return false;
    }
    node.prune_fail_reports(ctx.now, validity);
    let failures = node.fail_reports.len() + myself_votes;
    if failures < needed {
        debug!("node {} has {failures}/{needed} failure reports", id);
        return false;
    }

    info!("marking node {} as failing (quorum reached: {failures}/{needed})", id);
    mark_failed(state, ctx, id, fx);
    true
}

/// Sets FAIL on a suspect and tells everyone.
fn mark_failed(state: &mut ClusterState, ctx: &Context<'_>, id: NodeId, fx: &mut Effects) {
    if !set_failed(state, id, ctx.now) {
        return;
    }
    fx.event(ClusterEvent::NodeFailed(id));
    let msg = fail_message(state, ctx.config, id, ctx.replication_offset);
    fx.broadcast(state, msg);
}

/// Flags `id` FAIL, clearing PFAIL. Returns false if it already was.
fn set_failed(state: &mut ClusterState, id: NodeId, now: u64) -> bool {
    match state.lookup_mut(&id) {
        Some(node) if !node.is_myself() && !node.flags.fail => {
            node.flags.fail = true;
            node.flags.pfail = false;
            node.fail_time = now;
            true
        }
        _ => false,
    }
}

/// Applies a FAIL announcement from a known sender.
pub fn handle_fail(
    state: &mut ClusterState,
    sender: NodeId,
    failed: NodeId,
    now: u64,
    fx: &mut Effects,
) {
    if state.lookup(&sender).is_none() {
        debug!("ignoring FAIL about {} from unknown sender {}", failed, sender);
        return;
    }
    if set_failed(state, failed, now) {
        info!("FAIL message received from {} about {}", sender, failed);
        fx.event(ClusterEvent::NodeFailed(failed));
    }
}

/// Records what `sender` gossiped about `id`: a failing entry adds or
/// refreshes a report and may complete the quorum, a healthy one withdraws
/// it. Only primaries' opinions count.
pub fn record_gossip_opinion(
    state: &mut ClusterState,
    ctx: &Context<'_>,
    sender: NodeId,
    id: NodeId,
    failing: bool,
    fx: &mut Effects,
) {
    let sender_is_primary = state.lookup(&sender).is_some_and(|n| n.is_primary());
    if !sender_is_primary || id == state.myself_id() {
        return;
    }
    let Some(node) = state.lookup_mut(&id) else {
        return;
    };
    if failing {
        if node.add_fail_report(sender, ctx.now) {
            debug!("node {} reported node {} as not reachable", sender, id);
        }
        mark_failing_if_needed(state, ctx, id, fx);
    } else if node.remove_fail_report(sender) {
        debug!("node {} reported node {} is back online", sender, id);
    }
}

/// Handles a PONG from `id`: the ping is answered, PFAIL is cleared, and
/// FAIL is cleared when that can't cause flapping.
///
/// FAIL is undone right away for replicas and for primaries without slots.
/// A primary that still owns slots has to stay failed for the undo window
/// first, to give its replicas a chance to take over.
pub fn handle_pong(state: &mut ClusterState, ctx: &Context<'_>, id: NodeId, fx: &mut Effects) {
    let undo = ctx.config.fail_undo_ms();
    let Some(node) = state.lookup_mut(&id) else {
        return;
    };
    node.pong_received = ctx.now;
    node.ping_sent = NEVER;

    if node.flags.pfail {
        node.flags.pfail = false;
        info!("clear PFAIL state for node {}: it is reachable again", id);
        fx.event(ClusterEvent::NodeRecovered(id));
    } else if node.flags.fail {
        let failed_for = elapsed_since(node.fail_time, ctx.now).unwrap_or(0);
        if node.is_replica() || node.slots.is_empty() || failed_for > undo {
            node.flags.fail = false;
            info!("clear FAIL state for node {}: it is reachable again", id);
            fx.event(ClusterEvent::NodeRecovered(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::link::create_link;
    use crate::link::testing::RecordingTransport;
    use crate::message::{MessagePayload, MessageType};
    use crate::node::ClusterNode;
    use crate::slots::{SlotBitmap, SlotRange, SLOT_COUNT};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    const T0: u64 = 1_000_000;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            node_timeout: Duration::from_millis(1000),
            ..ClusterConfig::default()
        }
    }

    fn ctx(config: &ClusterConfig, now: u64) -> Context<'_> {
        Context {
            config,
            now,
            replication_offset: 0,
        }
    }

    /// Five slot-owning primaries (myself first), each with a recording link.
    fn five_primaries() -> (ClusterState, Vec<NodeId>, Vec<Arc<RecordingTransport>>) {
        let share = SLOT_COUNT / 5;
        let slots = |i: u16| {
            let end = if i == 4 { SLOT_COUNT - 1 } else { (i + 1) * share - 1 };
            SlotBitmap::from_ranges(&[SlotRange::new(i * share, end)])
        };
        let mut me = ClusterNode::new_primary(NodeId::new(), addr(7000), 17000);
        me.slots = slots(0);
        let mut ids = vec![me.id];
        let mut state = ClusterState::new(me);
        let mut transports = Vec::new();
        for i in 1..5u16 {
            let mut node = ClusterNode::new_primary(NodeId::new(), addr(7000 + i), 17000 + i);
            node.slots = slots(i);
            let transport = Arc::new(RecordingTransport::default());
            create_link(&mut node, transport.clone());
            transports.push(transport);
            ids.push(node.id);
            state.upsert(node);
        }
        (state, ids, transports)
    }

    #[test]
    fn overdue_pong_marks_pfail_once() {
        let config = config();
        let (mut state, ids, _) = five_primaries();
        state.lookup_mut(&ids[1]).unwrap().ping_sent = T0;

        let mut fx = Effects::new();
        check_timeouts(&mut state, &ctx(&config, T0 + 1000), &mut fx);
        assert!(!state.lookup(&ids[1]).unwrap().flags.pfail, "not yet overdue");

        check_timeouts(&mut state, &ctx(&config, T0 + 1001), &mut fx);
        check_timeouts(&mut state, &ctx(&config, T0 + 1002), &mut fx);
        let node = state.lookup(&ids[1]).unwrap();
        assert!(node.flags.pfail);
        assert!(!node.flags.fail);
        assert_eq!(fx.events, vec![ClusterEvent::NodeSuspected(ids[1])]);
    }

    #[test]
    fn quorum_of_reports_promotes_to_fail_and_broadcasts() {
        let config = config();
        let (mut state, ids, transports) = five_primaries();
        let target = ids[4];
        state.lookup_mut(&target).unwrap().flags.pfail = true;
        let mut fx = Effects::new();

        // myself + 1 report = 2 of 3 needed
        record_gossip_opinion(&mut state, &ctx(&config, T0), ids[1], target, true, &mut fx);
        assert!(!state.lookup(&target).unwrap().flags.fail);

        // same reporter again is a refresh, not a new vote
        record_gossip_opinion(&mut state, &ctx(&config, T0 + 10), ids[1], target, true, &mut fx);
        assert!(!state.lookup(&target).unwrap().flags.fail);

        record_gossip_opinion(&mut state, &ctx(&config, T0 + 20), ids[2], target, true, &mut fx);
        let node = state.lookup(&target).unwrap();
        assert!(node.flags.fail);
        assert!(!node.flags.pfail);
        assert_eq!(node.fail_time, T0 + 20);
        assert_eq!(fx.events, vec![ClusterEvent::NodeFailed(target)]);

        // one FAIL per linked peer, including the failed node itself
        assert_eq!(fx.sends.len(), transports.len());
        for (_, msg) in &fx.sends {
            assert_eq!(msg.kind, MessageType::Fail);
            assert_eq!(msg.payload, MessagePayload::Fail { node: target });
        }

        // further reports don't fail it twice
        record_gossip_opinion(&mut state, &ctx(&config, T0 + 30), ids[3], target, true, &mut fx);
        assert_eq!(fx.events.len(), 1);
    }

    #[test]
    fn stale_reports_are_pruned() {
        let config = config();
        let (mut state, ids, _) = five_primaries();
        let target = ids[4];
        state.lookup_mut(&target).unwrap().flags.pfail = true;
        let mut fx = Effects::new();

        record_gossip_opinion(&mut state, &ctx(&config, T0), ids[1], target, true, &mut fx);
        // validity is 2 * node_timeout; the first report expired
        record_gossip_opinion(&mut state, &ctx(&config, T0 + 2001), ids[2], target, true, &mut fx);

        let node = state.lookup(&target).unwrap();
        assert!(!node.flags.fail);
        assert_eq!(node.fail_reports.len(), 1);
    }

    #[test]
    fn reports_never_fail_a_node_we_dont_suspect() {
        let config = config();
        let (mut state, ids, _) = five_primaries();
        let target = ids[4];
        let mut fx = Effects::new();
        for reporter in &ids[1..4] {
            record_gossip_opinion(&mut state, &ctx(&config, T0), *reporter, target, true, &mut fx);
        }
        let node = state.lookup(&target).unwrap();
        assert!(!node.flags.fail);
        assert_eq!(node.fail_reports.len(), 3);

        // once we suspect it ourselves the stored reports complete the quorum
        state.lookup_mut(&target).unwrap().flags.pfail = true;
        assert!(mark_failing_if_needed(&mut state, &ctx(&config, T0 + 5), target, &mut fx));
    }

    #[test]
    fn healthy_gossip_withdraws_report() {
        let config = config();
        let (mut state, ids, _) = five_primaries();
        let mut fx = Effects::new();
        record_gossip_opinion(&mut state, &ctx(&config, T0), ids[1], ids[2], true, &mut fx);
        record_gossip_opinion(&mut state, &ctx(&config, T0), ids[1], ids[2], false, &mut fx);
        assert!(state.lookup(&ids[2]).unwrap().fail_reports.is_empty());
    }

    #[test]
    fn replica_opinions_dont_count() {
        let config = config();
        let (mut state, ids, _) = five_primaries();
        let replica = NodeId::new();
        state.upsert(ClusterNode::new_replica(replica, addr(7100), 17100, ids[1]));
        let mut fx = Effects::new();
        record_gossip_opinion(&mut state, &ctx(&config, T0), replica, ids[2], true, &mut fx);
        assert!(state.lookup(&ids[2]).unwrap().fail_reports.is_empty());
    }

    #[test]
    fn local_deadline_fails_without_quorum() {
        let config = config();
        let (mut state, ids, _) = five_primaries();
        state.lookup_mut(&ids[3]).unwrap().ping_sent = T0;
        let mut fx = Effects::new();

        check_timeouts(&mut state, &ctx(&config, T0 + 1500), &mut fx);
        assert!(state.lookup(&ids[3]).unwrap().flags.pfail);

        // fail_confirm_mult defaults to 4
        check_timeouts(&mut state, &ctx(&config, T0 + 4001), &mut fx);
        assert!(state.lookup(&ids[3]).unwrap().flags.fail);
        assert_eq!(
            fx.events,
            vec![
                ClusterEvent::NodeSuspected(ids[3]),
                ClusterEvent::NodeFailed(ids[3])
            ]
        );
    }

    #[test]
    fn fail_message_from_known_sender() {
        let (mut state, ids, _) = five_primaries();
        let mut fx = Effects::new();

        handle_fail(&mut state, NodeId::new(), ids[2], T0, &mut fx);
        assert!(!state.lookup(&ids[2]).unwrap().flags.fail);

        handle_fail(&mut state, ids[1], ids[2], T0, &mut fx);
        assert!(state.lookup(&ids[2]).unwrap().flags.fail);

        // never about myself
        handle_fail(&mut state, ids[1], ids[0], T0, &mut fx);
        assert!(!state.myself().flags.fail);
        assert_eq!(fx.events, vec![ClusterEvent::NodeFailed(ids[2])]);
    }

    #[test]
    fn pong_clears_pfail() {
        let config = config();
        let (mut state, ids, _) = five_primaries();
        let node = state.lookup_mut(&ids[1]).unwrap();
        node.flags.pfail = true;
        node.ping_sent = T0;
        let mut fx = Effects::new();

        handle_pong(&mut state, &ctx(&config, T0 + 50), ids[1], &mut fx);
        let node = state.lookup(&ids[1]).unwrap();
        assert!(!node.flags.pfail);
        assert_eq!(node.ping_sent, NEVER);
        assert_eq!(node.pong_received, T0 + 50);
        assert_eq!(fx.events, vec![ClusterEvent::NodeRecovered(ids[1])]);
    }

    #[test]
    fn failed_primary_with_slots_stays_failed_for_undo_window() {
        let config = config();
        let (mut state, ids, _) = five_primaries();
        let node = state.lookup_mut(&ids[1]).unwrap();
        node.flags.fail = true;
        node.fail_time = T0;
        let mut fx = Effects::new();

        handle_pong(&mut state, &ctx(&config, T0 + 500), ids[1], &mut fx);
        assert!(state.lookup(&ids[1]).unwrap().flags.fail);

        // fail_undo_mult defaults to 2
        handle_pong(&mut state, &ctx(&config, T0 + 2001), ids[1], &mut fx);
        assert!(!state.lookup(&ids[1]).unwrap().flags.fail);
    }

    #[test]
    fn failed_replica_recovers_immediately() {
        let config = config();
        let (mut state, ids, _) = five_primaries();
        let replica = NodeId::new();
        let mut node = ClusterNode::new_replica(replica, addr(7100), 17100, ids[1]);
        node.flags.fail = true;
        node.fail_time = T0;
        state.upsert(node);
        let mut fx = Effects::new();

        handle_pong(&mut state, &ctx(&config, T0 + 1), replica, &mut fx);
        assert!(!state.lookup(&replica).unwrap().flags.fail);
    }
}
