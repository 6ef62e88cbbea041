//! The cluster bus listener and its periodic work.
//!
//! One loop accepts inbound bus connections, runs the cron tick and opens
//! links to nodes that lack one. On SIGINT it stops accepting, frees every
//! link and returns.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use watchdog_cluster::{ClusterBus, ClusterEvent, Link, NodeId, Transport};

use crate::config::ServerConfig;
use crate::transport::Connection;

/// Maximum number of concurrent inbound bus connections.
const MAX_INBOUND_CONNECTIONS: usize = 1024;

/// Events buffered between the bus and the logger.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Longest we wait for an outbound connect before retrying on a later tick.
const MAX_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the node until SIGINT.
pub async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let bind = config.bus_bind_addr()?;
    let myself = config.local_node()?;
    let seeds = config.seeds()?;

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let bus = Arc::new(ClusterBus::new(config.cluster.clone(), myself, Some(event_tx))?);
    tokio::spawn(log_events(event_rx));

    let listener = TcpListener::bind(bind).await?;
    info!("cluster bus listening on {bind} as {}", bus.myself_id());

    for (addr, bus_port) in seeds {
        if bus.meet(addr, bus_port).await.is_none() {
            warn!("ignoring seed {addr}@{bus_port}");
        }
    }

    let semaphore = Arc::new(Semaphore::new(MAX_INBOUND_CONNECTIONS));
    let dialing = Arc::new(Mutex::new(HashSet::new()));
    let dial_timeout = config.cluster.node_timeout.min(MAX_DIAL_TIMEOUT);

    let mut ticker = tokio::time::interval(config.cluster.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received, closing cluster links...");
                break;
            }

            result = listener.accept() => {
                let (stream, peer) = result?;
                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection limit reached, dropping bus connection from {peer}");
                        continue;
                    }
                };
                debug!("accepted bus connection from {peer}");
                let conn = Connection::open(stream, peer);
                let link = Link::new(conn.transport());
                let bus = Arc::clone(&bus);
                tokio::spawn(async move {
                    conn.serve(bus, link).await;
                    drop(permit);
                });
            }

            _ = ticker.tick() => {
                bus.tick().await;
                for (id, addr) in bus.nodes_needing_link().await {
                    if mark_dialing(&dialing, id) {
                        tokio::spawn(dial(Arc::clone(&bus), Arc::clone(&dialing), id, addr, dial_timeout));
                    }
                }
            }
        }
    }

    bus.shutdown().await;
    info!("cluster bus stopped");
    Ok(())
}

/// Records an outbound attempt to `id`. False if one is already running.
fn mark_dialing(dialing: &Mutex<HashSet<NodeId>>, id: NodeId) -> bool {
    dialing.lock().unwrap_or_else(|e| e.into_inner()).insert(id)
}

/// Opens a link to `id` at `addr` and serves it until it closes.
async fn dial(
    bus: Arc<ClusterBus>,
    dialing: Arc<Mutex<HashSet<NodeId>>>,
    id: NodeId,
    addr: SocketAddr,
    timeout: Duration,
) {
    let result = Connection::dial(addr, timeout).await;
    dialing
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id);

    let conn = match result {
        Ok(conn) => conn,
        Err(e) => {
            debug!("connecting to node {id} at {addr} failed: {e}");
            return;
        }
    };
    let transport = conn.transport();
    match bus.connect(id, transport.clone()).await {
        Some(link) => {
            debug!("link {} opened to node {id} at {addr}", link.id());
            conn.serve(bus, link).await;
        }
        // the node was renamed or forgotten while we dialed
        None => transport.disconnect(),
    }
}

async fn log_events(mut rx: mpsc::Receiver<ClusterEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ClusterEvent::NodeAdded(id, addr) => info!("node {id} joined from {addr}"),
            ClusterEvent::NodeSuspected(id) => info!("node {id} is possibly failing"),
            ClusterEvent::NodeFailed(id) => warn!("node {id} marked as failed"),
            ClusterEvent::NodeRecovered(id) => info!("node {id} is reachable again"),
            ClusterEvent::NodeForgotten(id) => info!("node {id} forgotten"),
            ClusterEvent::SlotsChanged(id, ranges) => {
                let ranges: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
                info!("node {id} now serves slots [{}]", ranges.join(" "));
            }
            ClusterEvent::FailoverWon { epoch, replaced } => {
                warn!("failover won at config epoch {epoch}, replacing {replaced}")
            }
            ClusterEvent::BecameReplica(primary) => info!("now replicating {primary}"),
        }
    }
}
