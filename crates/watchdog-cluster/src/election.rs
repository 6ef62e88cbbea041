//! Automatic failover election.
//!
//! When its primary is flagged FAIL, a replica waits a ranked delay, then
//! asks every primary to vote for it in the next epoch. A primary grants at
//! most one vote per epoch and at most one per failed primary within twice
//! the node timeout. The first replica to collect votes from a majority of
//! slot-owning primaries takes over the failed primary's slots with the
//! voted epoch as its new config epoch.
//!
//! Nothing is changed locally until the majority is in. An election that
//! times out is simply abandoned and retried later at a fresh epoch.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::events::{ClusterEvent, Context, Effects};
use crate::header::build_header;
use crate::link::Link;
use crate::message::{ClusterMessage, MessageType};
use crate::node::NodeRole;
use crate::sampler::build_heartbeat;
use crate::state::ClusterState;
use crate::time::{elapsed_since, NEVER};
use crate::NodeId;

/// Fixed part of the delay before a replica asks for votes.
const FAILOVER_BASE_DELAY_MS: u64 = 500;
/// Upper bound of the random part of that delay.
const FAILOVER_JITTER_MS: u64 = 500;
/// Extra delay per better-ranked sibling replica.
const FAILOVER_RANK_DELAY_MS: u64 = 1000;

/// Vote tally for one election.
#[derive(Debug)]
pub struct Election {
    /// Epoch this election is contesting.
    pub epoch: u64,
    /// Node IDs of primaries that have voted for us.
    votes: HashSet<NodeId>,
    /// Whether promotion has already been triggered for this election.
    promoted: bool,
}

impl Election {
    /// Creates a new election for the given epoch.
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            votes: HashSet::new(),
            promoted: false,
        }
    }

    /// Records a vote from `from`. Returns `true` if quorum is newly reached.
    ///
    /// `total_primaries` counts every slot-owning primary, the failed one
    /// included. Once quorum is reached this returns `true` exactly once, so
    /// the caller promotes exactly once.
    pub fn record_vote(&mut self, from: NodeId, total_primaries: usize) -> bool {
        if self.promoted {
            return false;
        }
        self.votes.insert(from);
        self.promoted = self.votes.len() >= Self::quorum(total_primaries);
        self.promoted
    }

    /// Minimum votes required for a majority.
    pub fn quorum(total_primaries: usize) -> usize {
        total_primaries / 2 + 1
    }

    pub fn votes(&self) -> usize {
        self.votes.len()
    }
}

/// Replica-side failover progress.
#[derive(Debug, Default)]
pub struct FailoverState {
    /// When the current attempt may send its request, or `NEVER`.
    pub auth_time: u64,
    /// The attempt in progress, once its request went out.
    pub election: Option<Election>,
    /// Sibling replicas with a better replication offset.
    pub rank: usize,
}

/// The failed primary this node should try to replace, if any.
fn failed_primary(state: &ClusterState) -> Option<NodeId> {
    let me = state.myself();
    let primary = state.lookup(&me.primary_id()?)?;
    (primary.flags.fail && !primary.slots.is_empty()).then_some(primary.id)
}

/// Sibling replicas advertising a higher replication offset than ours.
fn replica_rank(state: &ClusterState, primary: NodeId, my_offset: u64) -> usize {
    let me = state.myself_id();
    state
        .replicas_of(primary)
        .filter(|r| r.id != me && r.repl_offset > my_offset)
        .count()
}

/// Drives the replica side of a failover. Called from every tick.
pub fn handle_replica_failover<R: Rng + ?Sized>(
    state: &mut ClusterState,
    ctx: &Context<'_>,
    rng: &mut R,
    fx: &mut Effects,
) {
    let Some(primary) = failed_primary(state) else {
        return;
    };

    let auth_timeout = ctx.config.failover_auth_timeout_ms();
    let retry = auth_timeout.saturating_mul(2);
    let auth_age = elapsed_since(state.failover.auth_time, ctx.now).unwrap_or(u64::MAX);

    // no attempt yet, or the last one expired: schedule a new one
    if state.failover.auth_time == NEVER || auth_age > retry {
        let rank = replica_rank(state, primary, ctx.replication_offset);
        let delay = FAILOVER_BASE_DELAY_MS
            + rng.random_range(0..FAILOVER_JITTER_MS)
            + rank as u64 * FAILOVER_RANK_DELAY_MS;
        state.failover = FailoverState {
            auth_time: ctx.now + delay,
            election: None,
            rank,
        };
        info!(
            "start of election delayed for {delay}ms (rank #{rank}, offset {})",
            ctx.replication_offset
        );
        return;
    }

    if ctx.now < state.failover.auth_time {
        return;
    }
    if auth_age > auth_timeout {
        if state.failover.election.take().is_some() {
            warn!("failover attempt expired");
        }
        return;
    }
    if state.failover.election.is_some() {
        return;
    }

    let epoch = state.current_epoch + 1;
    state.failover.election = Some(Election::new(epoch));
    info!("starting a failover election for epoch {epoch}");
    let request = ClusterMessage {
        current_epoch: epoch,
        ..build_header(
            state,
            ctx.config,
            MessageType::FailoverAuthRequest,
            ctx.replication_offset,
        )
    };
    fx.broadcast(state, request);
}

/// Decides whether to vote for the replica that sent `request`, and queues
/// the ACK on `reply_to` if so.
///
/// Only slot-owning primaries vote. The request is refused when its epoch
/// is older than ours, when we already voted in this epoch, when the
/// requester isn't a known replica of a FAIL primary, when we voted for a
/// replica of the same primary less than twice the node timeout ago, or when
/// it claims slots we know a newer config for.
pub fn handle_auth_request(
    state: &mut ClusterState,
    ctx: &Context<'_>,
    request: &ClusterMessage,
    reply_to: &Arc<Link>,
    fx: &mut Effects,
) -> bool {
    state.observe_epoch(request.current_epoch);
    let me = state.myself();
    if me.is_replica() || me.slots.is_empty() {
        return false;
    }
    let requester = request.sender;
    if request.current_epoch < state.current_epoch {
        debug!(
            "failover auth denied to {}: epoch {} < {}",
            requester, request.current_epoch, state.current_epoch
        );
        return false;
    }
    if state.last_vote_epoch == state.current_epoch {
        debug!(
            "failover auth denied to {}: already voted for epoch {}",
            requester, state.current_epoch
        );
        return false;
    }

    let Some(node) = state.lookup(&requester) else {
        return false;
    };
    let primary_id = match node.role {
        NodeRole::Replica { primary: Some(id) } => id,
        _ => {
            debug!("failover auth denied to {}: not a replica", requester);
            return false;
        }
    };
    let Some(primary) = state.lookup(&primary_id) else {
        return false;
    };
    if !primary.flags.fail {
        debug!("failover auth denied to {}: its primary is up", requester);
        return false;
    }
    let throttle = ctx.config.node_timeout_ms().saturating_mul(2);
    if elapsed_since(primary.voted_time, ctx.now).is_some_and(|age| age < throttle) {
        debug!(
            "failover auth denied to {}: already voted for a replica of {} recently",
            requester, primary_id
        );
        return false;
    }
    for slot in request.slots.iter() {
        if let Some(owner) = state.slot_owner(slot) {
            if owner.config_epoch > request.config_epoch {
                debug!(
                    "failover auth denied to {}: slot {slot} has a newer config epoch {}",
                    requester, owner.config_epoch
                );
                return false;
            }
        }
    }

    state.last_vote_epoch = state.current_epoch;
    if let Some(primary) = state.lookup_mut(&primary_id) {
        primary.voted_time = ctx.now;
        primary.flags.failover_auth = true;
    }
    info!(
        "failover auth granted to {} for epoch {}",
        requester, state.current_epoch
    );
    let ack = build_header(
        state,
        ctx.config,
        MessageType::FailoverAuthAck,
        ctx.replication_offset,
    );
    fx.send(reply_to, ack);
    true
}

/// Counts a vote from `voter`. Promotes this node once a majority is in.
pub fn handle_auth_ack<R: Rng + ?Sized>(
    state: &mut ClusterState,
    ctx: &Context<'_>,
    voter: NodeId,
    ack_epoch: u64,
    rng: &mut R,
    fx: &mut Effects,
) -> bool {
    let voter_ok = state
        .lookup(&voter)
        .is_some_and(|n| n.is_primary() && !n.slots.is_empty());
    let Some(replaced) = failed_primary(state) else {
        return false;
    };
    let total = state.cluster_size();
    let Some(election) = state.failover.election.as_mut() else {
        return false;
    };
    if !voter_ok || ack_epoch < election.epoch {
        return false;
    }
    if !election.record_vote(voter, total) {
        debug!(
            "failover vote from {} ({}/{} needed)",
            voter,
            election.votes(),
            Election::quorum(total)
        );
        return false;
    }
    let epoch = election.epoch;
    promote_myself(state, ctx, replaced, epoch, rng, fx);
    true
}

/// Turns this replica into the primary for `replaced`'s slots.
fn promote_myself<R: Rng + ?Sized>(
    state: &mut ClusterState,
    ctx: &Context<'_>,
    replaced: NodeId,
    epoch: u64,
    rng: &mut R,
    fx: &mut Effects,
) {
    let slots = match state.lookup_mut(&replaced) {
        Some(old) => std::mem::take(&mut old.slots),
        None => return,
    };
    state.observe_epoch(epoch);
    let me = state.myself_mut();
    me.role = NodeRole::Primary;
    me.config_epoch = epoch;
    me.slots = slots;
    let id = me.id;
    let ranges = me.slots.ranges();
    state.failover = FailoverState::default();
    state.update_health();

    warn!("failover election won: now primary for epoch {epoch}, replacing {replaced}");
    fx.event(ClusterEvent::FailoverWon { epoch, replaced });
    fx.event(ClusterEvent::SlotsChanged(id, ranges));

    let pong = build_heartbeat(state, ctx.config, MessageType::Pong, None, ctx.now, 0, rng);
    fx.broadcast(state, pong);
}
