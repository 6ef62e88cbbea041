//! The cluster bus: one lock around the engine state, plus the async
//! plumbing that sends what the engine produced.
//!
//! Every entry point takes the state lock, runs a synchronous engine step
//! that collects its sends and events into [`Effects`], releases the lock,
//! and only then queues the sends on their links and hands the events to
//! the event channel. A slow or dead peer never stalls the lock or the tick.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::events::{ClusterEvent, Context, Effects};
use crate::gossip;
use crate::header::{ReplicationOffset, StaticOffset};
use crate::link::{free_link, Link, Transport};
use crate::message::{ClusterHealth, ClusterMessage, MessageType};
use crate::node::ClusterNode;
use crate::state::ClusterState;
use crate::stats::{BusStats, BusStatsSnapshot};
use crate::time::now_ms;
use crate::{ClusterError, NodeId};

struct Shared {
    state: ClusterState,
    rng: StdRng,
}

/// A running cluster bus node.
pub struct ClusterBus {
    config: ClusterConfig,
    myself: NodeId,
    shared: Mutex<Shared>,
    stats: Arc<BusStats>,
    replication: Arc<dyn ReplicationOffset>,
    event_tx: Option<mpsc::Sender<ClusterEvent>>,
    ticks: AtomicU64,
}

impl std::fmt::Debug for ClusterBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterBus")
            .field("myself", &self.myself)
            .field("ticks", &self.ticks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ClusterBus {
    /// Creates a bus for `myself` after validating `config`.
    ///
    /// Events are delivered on `event_tx` when given.
    pub fn new(
        config: ClusterConfig,
        myself: ClusterNode,
        event_tx: Option<mpsc::Sender<ClusterEvent>>,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        let id = myself.id;
        info!(
            "cluster bus for node {} announcing {} (bus port {}, protocol {:?})",
            id,
            config.announce_addr(),
            config.announce_bus_port,
            config.protocol_version
        );
        Ok(Self {
            config,
            myself: id,
            shared: Mutex::new(Shared {
                state: ClusterState::new(myself),
                rng: StdRng::from_os_rng(),
            }),
            stats: Arc::new(BusStats::default()),
            replication: Arc::new(StaticOffset::default()),
            event_tx,
            ticks: AtomicU64::new(0),
        })
    }

    /// Uses `source` for the replication offset advertised while replica.
    pub fn with_replication(mut self, source: Arc<dyn ReplicationOffset>) -> Self {
        self.replication = source;
        self
    }

    pub fn myself_id(&self) -> NodeId {
        self.myself
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Per-type message counters.
    pub fn stats(&self) -> BusStatsSnapshot {
        self.stats.snapshot()
    }

    /// Runs `step` against the state under the lock, then dispatches what
    /// it produced.
    async fn run<T>(
        &self,
        step: impl FnOnce(&mut ClusterState, &Context<'_>, &mut StdRng, &mut Effects) -> T,
    ) -> T {
        let mut fx = Effects::new();
        let out = {
            let mut shared = self.shared.lock().await;
            let Shared { state, rng } = &mut *shared;
            let ctx = Context {
                config: &self.config,
                now: now_ms(),
                replication_offset: self.replication.replication_offset(),
            };
            step(state, &ctx, rng, &mut fx)
        };
        self.dispatch(fx).await;
        out
    }

    /// Runs one cron tick. Call every `config.tick_interval`.
    pub async fn tick(&self) {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        self.run(|state, ctx, rng, fx| gossip::cron(state, ctx, tick, rng, fx))
            .await;
    }

    /// Handles a message decoded from `link`.
    pub async fn handle_message(&self, link: &Arc<Link>, msg: ClusterMessage) {
        self.stats.record_received(msg.kind);
        self.run(|state, ctx, rng, fx| gossip::process_message(state, ctx, link, &msg, rng, fx))
            .await;
    }

    /// Starts a handshake with the node at `addr`. Returns the provisional
    /// name, or `None` if the address is unusable or already being met.
    pub async fn meet(&self, addr: SocketAddr, bus_port: u16) -> Option<NodeId> {
        let mut shared = self.shared.lock().await;
        let id = gossip::start_handshake(&mut shared.state, addr, bus_port);
        if let Some(id) = id {
            info!("meeting {} (bus port {}) as {}", addr, bus_port, id);
        }
        id
    }

    /// Administratively removes a node.
    pub async fn forget(&self, id: NodeId) -> Result<(), ClusterError> {
        let forgotten = {
            let mut shared = self.shared.lock().await;
            let node = shared.state.forget(&id)?;
            shared.state.update_health();
            node.id
        };
        self.emit(ClusterEvent::NodeForgotten(forgotten)).await;
        Ok(())
    }

    /// Binds a new outbound connection to `id` and greets the peer.
    pub async fn connect(&self, id: NodeId, transport: Arc<dyn Transport>) -> Option<Arc<Link>> {
        self.run(|state, ctx, rng, fx| gossip::connect_node(state, ctx, id, transport, rng, fx))
            .await
    }

    /// Frees `link` after its transport went away.
    pub async fn link_closed(&self, link: &Arc<Link>) {
        let mut shared = self.shared.lock().await;
        gossip::link_closed(&mut shared.state, link);
    }

    /// Nodes without a link, with the bus address to dial.
    pub async fn nodes_needing_link(&self) -> Vec<(NodeId, SocketAddr)> {
        let shared = self.shared.lock().await;
        gossip::nodes_needing_link(&shared.state)
    }

    /// Read access to the registry for reporting.
    pub async fn with_state<T>(&self, f: impl FnOnce(&ClusterState) -> T) -> T {
        let shared = self.shared.lock().await;
        f(&shared.state)
    }

    pub async fn current_epoch(&self) -> u64 {
        self.with_state(|s| s.current_epoch).await
    }

    pub async fn health(&self) -> ClusterHealth {
        self.with_state(|s| s.health).await
    }

    /// The CLUSTER NODES table.
    pub async fn cluster_nodes(&self) -> String {
        self.with_state(|s| s.cluster_nodes()).await
    }

    /// The CLUSTER INFO summary, followed by the message counters.
    pub async fn cluster_info(&self) -> String {
        let mut info = self.with_state(|s| s.cluster_info()).await;
        let stats = self.stats();
        info.push_str(&format!(
            "cluster_stats_messages_sent:{}\r\n",
            stats.total_sent()
        ));
        for kind in MessageType::ALL {
            let sent = stats.sent(kind);
            if sent > 0 {
                info.push_str(&format!("cluster_stats_messages_{}_sent:{sent}\r\n", kind));
            }
        }
        info.push_str(&format!(
            "cluster_stats_messages_received:{}\r\n",
            stats.total_received()
        ));
        for kind in MessageType::ALL {
            let received = stats.received(kind);
            if received > 0 {
                info.push_str(&format!(
                    "cluster_stats_messages_{}_received:{received}\r\n",
                    kind
                ));
            }
        }
        info
    }

    /// Frees every link. In-flight sends fail with `LinkClosed`.
    pub async fn shutdown(&self) {
        let mut shared = self.shared.lock().await;
        let mut freed = 0;
        for node in shared.state.nodes_mut() {
            if let Some(link) = node.link.clone() {
                free_link(Some(&link), Some(node));
                freed += 1;
            }
        }
        info!("cluster bus shut down, {freed} links freed");
    }

    /// Queues sends on their links and delivers events.
    ///
    /// Each link drains its queue from a single writer task, so messages for
    /// one link go out in the order the engine produced them, across steps.
    async fn dispatch(&self, fx: Effects) {
        let mut by_link: HashMap<u64, (Arc<Link>, Vec<Arc<ClusterMessage>>)> = HashMap::new();
        let mut order = Vec::new();
        for (link, msg) in fx.sends {
            by_link
                .entry(link.id())
                .or_insert_with(|| {
                    order.push(link.id());
                    (Arc::clone(&link), Vec::new())
                })
                .1
                .push(msg);
        }
        for id in order {
            if let Some((link, msgs)) = by_link.remove(&id) {
                link.enqueue(msgs, &self.stats);
            }
        }

        for event in fx.events {
            self.emit(event).await;
        }
    }

    async fn emit(&self, event: ClusterEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        if tx.send(event).await.is_err() {
            warn!("cluster event channel closed, dropping event");
        }
    }
}
