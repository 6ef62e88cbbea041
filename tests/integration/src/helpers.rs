//! Test helpers for running several cluster bus nodes in one process.
//!
//! Nodes talk over in-memory pipes that carry encoded frames, so every
//! message goes through the real codec. Each node gets a driver task that
//! ticks its bus and opens links the way the server's connection manager
//! does. A node can be taken down, which drops everything it would send or
//! receive and refuses new connections to it, without losing its state.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use watchdog_cluster::{
    ClusterBus, ClusterConfig, ClusterError, ClusterEvent, ClusterMessage, ClusterNode,
    ClusterState, Link, NodeId, SlotBitmap, SlotRange, Transport,
};

/// Node timeout used by every test cluster.
pub const NODE_TIMEOUT: Duration = Duration::from_millis(300);

const TICK: Duration = Duration::from_millis(20);

/// Slots served by the `i`th of three primaries.
pub fn third(i: usize) -> SlotRange {
    match i {
        0 => SlotRange::new(0, 5460),
        1 => SlotRange::new(5461, 10922),
        _ => SlotRange::new(10923, 16383),
    }
}

#[derive(Clone)]
struct Peer {
    bus: Arc<ClusterBus>,
    down: Arc<AtomicBool>,
}

type Directory = Arc<Mutex<HashMap<SocketAddr, Peer>>>;

/// One side of an in-memory connection.
#[derive(Debug)]
struct PipeTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    closed: Arc<watch::Sender<bool>>,
    local_down: Arc<AtomicBool>,
    remote_down: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, msg: &ClusterMessage) -> Result<(), ClusterError> {
        if *self.closed.borrow() {
            return Err(ClusterError::LinkClosed);
        }
        if self.local_down.load(Ordering::Acquire) || self.remote_down.load(Ordering::Acquire) {
            return Err(ClusterError::Transport("node is down".into()));
        }
        self.tx
            .send(msg.encode())
            .map_err(|_| ClusterError::LinkClosed)
    }

    fn disconnect(&self) {
        self.closed.send_replace(true);
    }
}

/// Delivers frames arriving on `rx` to `bus` until the pipe is closed.
async fn pump(
    bus: Arc<ClusterBus>,
    link: Arc<Link>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut closed: watch::Receiver<bool>,
    down: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if down.load(Ordering::Acquire) {
                    continue;
                }
                match ClusterMessage::decode(&frame) {
                    Ok(msg) => bus.handle_message(&link, msg).await,
                    Err(e) => panic!("undecodable frame on the bus: {e}"),
                }
            }
        }
    }
    bus.link_closed(&link).await;
}

/// Opens a pipe from `local` to the node reachable at `addr`.
async fn dial(directory: &Directory, local: &Peer, id: NodeId, addr: SocketAddr) {
    let remote = match directory.lock().unwrap().get(&addr) {
        Some(peer) => peer.clone(),
        None => return,
    };
    if remote.down.load(Ordering::Acquire) {
        return;
    }

    let (closed_tx, closed_rx) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);
    let (to_remote, remote_rx) = mpsc::unbounded_channel();
    let (to_local, local_rx) = mpsc::unbounded_channel();

    let outbound = Arc::new(PipeTransport {
        tx: to_remote,
        closed: Arc::clone(&closed_tx),
        local_down: Arc::clone(&local.down),
        remote_down: Arc::clone(&remote.down),
    });
    let inbound = Arc::new(PipeTransport {
        tx: to_local,
        closed: closed_tx,
        local_down: Arc::clone(&remote.down),
        remote_down: Arc::clone(&local.down),
    });

    // the accepting side starts unbound, like an accepted socket
    let remote_link = Link::new(inbound);
    tokio::spawn(pump(
        Arc::clone(&remote.bus),
        remote_link,
        remote_rx,
        closed_rx.clone(),
        Arc::clone(&remote.down),
    ));

    match local.bus.connect(id, outbound.clone()).await {
        Some(link) => {
            tokio::spawn(pump(
                Arc::clone(&local.bus),
                link,
                local_rx,
                closed_rx,
                Arc::clone(&local.down),
            ));
        }
        None => outbound.disconnect(),
    }
}

/// Ticks `peer` and keeps its links open while it is up.
async fn drive(directory: Directory, peer: Peer) {
    let mut ticker = tokio::time::interval(TICK);
    loop {
        ticker.tick().await;
        if peer.down.load(Ordering::Acquire) {
            continue;
        }
        peer.bus.tick().await;
        for (id, addr) in peer.bus.nodes_needing_link().await {
            dial(&directory, &peer, id, addr).await;
        }
    }
}

/// A node managed by [`TestCluster`].
pub struct TestNode {
    pub bus: Arc<ClusterBus>,
    pub addr: SocketAddr,
    pub bus_port: u16,
    down: Arc<AtomicBool>,
    events: Arc<Mutex<Vec<ClusterEvent>>>,
    driver: JoinHandle<()>,
}

impl TestNode {
    pub fn id(&self) -> NodeId {
        self.bus.myself_id()
    }

    /// Every event this node has emitted so far.
    pub fn events(&self) -> Vec<ClusterEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Runs `check` against this node's registry.
    pub async fn check<T>(&self, check: impl FnOnce(&ClusterState) -> T) -> T {
        self.bus.with_state(check).await
    }
}

/// Several cluster bus nodes wired together in memory.
#[derive(Default)]
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    directory: Directory,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `n` primaries splitting the slot space in thirds (n <= 3).
    pub fn with_primaries(n: usize) -> Self {
        let mut cluster = Self::new();
        for i in 0..n {
            cluster.add_primary(&[third(i)]);
        }
        cluster
    }

    fn config(&self) -> ClusterConfig {
        let i = self.nodes.len() as u16;
        ClusterConfig {
            announce_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announce_port: 7000 + i,
            announce_bus_port: 17000 + i,
            node_timeout: NODE_TIMEOUT,
            tick_interval: TICK,
            ..ClusterConfig::default()
        }
    }

    /// Starts a primary serving `slots`. Returns its index.
    pub fn add_primary(&mut self, slots: &[SlotRange]) -> usize {
        let config = self.config();
        let mut node =
            ClusterNode::new_primary(NodeId::new(), config.announce_addr(), config.announce_bus_port);
        node.slots = SlotBitmap::from_ranges(slots);
        self.spawn(config, node)
    }

    /// Starts a replica of the node at index `primary`. Returns its index.
    pub fn add_replica(&mut self, primary: usize) -> usize {
        let config = self.config();
        let node = ClusterNode::new_replica(
            NodeId::new(),
            config.announce_addr(),
            config.announce_bus_port,
            self.nodes[primary].id(),
        );
        self.spawn(config, node)
    }

    fn spawn(&mut self, config: ClusterConfig, node: ClusterNode) -> usize {
        let bus_addr = SocketAddr::new(config.announce_ip, config.announce_bus_port);
        let addr = config.announce_addr();
        let bus_port = config.announce_bus_port;

        let (event_tx, mut event_rx) = mpsc::channel(1024);
        let bus = Arc::new(ClusterBus::new(config, node, Some(event_tx)).unwrap());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                sink.lock().unwrap().push(event);
            }
        });

        let peer = Peer {
            bus: Arc::clone(&bus),
            down: Arc::new(AtomicBool::new(false)),
        };
        self.directory
            .lock()
            .unwrap()
            .insert(bus_addr, peer.clone());
        let down = Arc::clone(&peer.down);
        let driver = tokio::spawn(drive(Arc::clone(&self.directory), peer));

        self.nodes.push(TestNode {
            bus,
            addr,
            bus_port,
            down,
            events,
            driver,
        });
        self.nodes.len() - 1
    }

    pub fn node(&self, i: usize) -> &TestNode {
        &self.nodes[i]
    }

    /// Makes node `a` meet node `b`.
    pub async fn meet(&self, a: usize, b: usize) {
        let target = &self.nodes[b];
        let id = self.nodes[a]
            .bus
            .meet(target.addr, target.bus_port)
            .await;
        assert!(id.is_some(), "node {a} refused to meet node {b}");
    }

    /// Every node meets node 0, then waits until all of them know each
    /// other by name and report a healthy cluster.
    pub async fn join_all(&self) {
        for i in 1..self.nodes.len() {
            self.meet(i, 0).await;
        }
        let n = self.nodes.len();
        for i in 0..n {
            self.wait_until(i, "full membership", move |s| {
                s.len() == n
                    && s.nodes()
                        .all(|node| node.is_myself() || (!node.in_handshake() && node.link.is_some()))
            })
            .await;
        }
    }

    /// Waits until every primary has a distinct config epoch and all nodes
    /// agree on the current epoch.
    pub async fn settle_epochs(&self) {
        for i in 0..self.nodes.len() {
            self.wait_until(i, "distinct config epochs", |s| {
                let mut epochs: Vec<u64> = s.primaries().map(|n| n.config_epoch).collect();
                let total = epochs.len();
                epochs.sort_unstable();
                epochs.dedup();
                epochs.len() == total
            })
            .await;
        }
        let this = self;
        let agreed = wait_for(Duration::from_secs(10), move || async move {
            let mut epochs = Vec::new();
            for node in &this.nodes {
                epochs.push(node.bus.current_epoch().await);
            }
            epochs.windows(2).all(|w| w[0] == w[1])
        })
        .await;
        assert!(agreed, "nodes never agreed on the current epoch");
    }

    /// Takes node `i` off the network. Its state is kept.
    pub fn stop(&self, i: usize) {
        self.nodes[i].down.store(true, Ordering::Release);
    }

    /// Brings node `i` back.
    pub fn restart(&self, i: usize) {
        self.nodes[i].down.store(false, Ordering::Release);
    }

    /// Polls node `i` until `check` holds, panicking after a deadline.
    pub async fn wait_until(
        &self,
        i: usize,
        what: &str,
        check: impl Fn(&ClusterState) -> bool,
    ) {
        let node = &self.nodes[i];
        let check = &check;
        let ok = wait_for(Duration::from_secs(10), move || node.check(move |s| check(s))).await;
        if !ok {
            let table = node.bus.cluster_nodes().await;
            panic!("node {i} never reached: {what}\n{table}");
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.driver.abort();
        }
    }
}

/// Polls `check` every few milliseconds until it returns true or `timeout`
/// passes. Returns whether it succeeded.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
