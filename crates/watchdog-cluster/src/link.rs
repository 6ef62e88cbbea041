//! Logical bus connections between nodes.
//!
//! A [`Link`] wraps one transport connection and outlives any single
//! message exchange. It is owned by the node it is bound to (through
//! `ClusterNode::link`) and refers back to that node by ID only. Inbound
//! connections start unbound until the peer's identity is known.
//!
//! Each link has one outbound queue drained by one writer task, so messages
//! reach the transport in the order they were queued, whichever engine step
//! produced them. Freeing a link while a send is in flight only makes that
//! send fail with [`ClusterError::LinkClosed`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::message::ClusterMessage;
use crate::node::ClusterNode;
use crate::stats::BusStats;
use crate::{ClusterError, NodeId};

/// The byte-moving side of a link.
///
/// Implementations own the socket (or channel) and the wire codec. `send`
/// resolves once the message has been handed to the peer's connection;
/// `disconnect` tears the connection down and must be safe to call more
/// than once.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, msg: &ClusterMessage) -> Result<(), ClusterError>;

    fn disconnect(&self);
}

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// A live logical channel to one peer.
pub struct Link {
    id: u64,
    /// When the link was created, in unix millis.
    created: u64,
    /// The node this link is bound to. `None` during an inbound handshake.
    node: Mutex<Option<NodeId>>,
    closed: AtomicBool,
    transport: Arc<dyn Transport>,
    /// Feeds the writer task, started by the first [`Link::enqueue`].
    outbox: Mutex<Option<mpsc::UnboundedSender<Vec<Arc<ClusterMessage>>>>>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("node", &self.node())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Creates an unbound link, as for an accepted inbound connection.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            created: crate::time::now_ms(),
            node: Mutex::new(None),
            closed: AtomicBool::new(false),
            transport,
            outbox: Mutex::new(None),
        })
    }

    /// Process-unique link identifier, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    /// The node this link is bound to, if any.
    pub fn node(&self) -> Option<NodeId> {
        *self.node.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends a message over the transport.
    ///
    /// Fails fast with [`ClusterError::LinkClosed`] once the link is freed.
    pub async fn send(&self, msg: &ClusterMessage) -> Result<(), ClusterError> {
        if self.is_closed() {
            return Err(ClusterError::LinkClosed);
        }
        self.transport.send(msg).await
    }

    /// Queues `msgs` behind everything queued on this link before.
    ///
    /// Failures are counted in `stats` and dropped; gossip repeats itself.
    pub fn enqueue(self: &Arc<Self>, msgs: Vec<Arc<ClusterMessage>>, stats: &Arc<BusStats>) {
        let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        let tx = outbox.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(write_loop(Arc::downgrade(self), rx, Arc::clone(stats)));
            tx
        });
        if let Err(mpsc::error::SendError(msgs)) = tx.send(msgs) {
            for _ in msgs {
                stats.record_send_error();
            }
        }
    }

    fn bind(&self, id: NodeId) {
        *self.node.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    fn unbind(&self) -> Option<NodeId> {
        self.node.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Closes the transport. Only the first call reaches it.
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.transport.disconnect();
        }
    }
}

/// Drains one link's queue until the link is dropped.
async fn write_loop(
    weak: Weak<Link>,
    mut rx: mpsc::UnboundedReceiver<Vec<Arc<ClusterMessage>>>,
    stats: Arc<BusStats>,
) {
    while let Some(msgs) = rx.recv().await {
        let Some(link) = weak.upgrade() else {
            break;
        };
        for msg in msgs {
            match link.send(&msg).await {
                Ok(()) => stats.record_sent(msg.kind),
                Err(e) => {
                    debug!("dropping {} on link {}: {e}", msg.kind, link.id);
                    stats.record_send_error();
                }
            }
        }
    }
}

/// Creates a link over `transport` and binds it to `node` in both
/// directions. Any previous link of the node is freed first, so a node
/// never has more than one.
pub fn create_link(node: &mut ClusterNode, transport: Arc<dyn Transport>) -> Arc<Link> {
    let link = Link::new(transport);
    attach_link(node, Arc::clone(&link));
    link
}

/// Binds an existing link (for example an inbound one whose peer just
/// identified itself) to `node`.
pub fn attach_link(node: &mut ClusterNode, link: Arc<Link>) {
    if let Some(old) = node.link.take() {
        if !Arc::ptr_eq(&old, &link) {
            old.unbind();
            old.close();
        }
    }
    link.bind(node.id);
    debug!("link {} bound to node {}", link.id, node.id);
    node.link = Some(link);
}

/// Frees a link: detaches it from its node and disconnects the transport.
///
/// Null-safe and idempotent. `node` is the record the link is bound to, if
/// the caller has it at hand; it is only detached when it still points at
/// this very link.
pub fn free_link(link: Option<&Arc<Link>>, node: Option<&mut ClusterNode>) {
    let Some(link) = link else {
        return;
    };
    let bound = link.unbind();
    if let Some(node) = node {
        let same = node
            .link
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, link));
        if same && bound.map_or(true, |id| id == node.id) {
            node.link = None;
        }
    }
    link.close();
}
