//! TCP transport for the cluster bus.
//!
//! Each connection carries length-prefixed frames: a 4-byte big-endian
//! length followed by one encoded [`ClusterMessage`]. Writes go through a
//! bounded queue drained by a dedicated task, so a send never blocks the
//! engine on a slow socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use watchdog_cluster::{ClusterBus, ClusterError, ClusterMessage, Link, Transport};

/// Largest frame accepted from a peer. A full heartbeat with the maximum
/// gossip section stays well below this.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Frames queued per connection before sends start failing.
const SEND_QUEUE_DEPTH: usize = 256;

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(w: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame size {} exceeds limit {MAX_FRAME_SIZE}", payload.len()),
        ));
    }
    w.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Reads one length-prefixed frame, rejecting oversized ones. Returns
/// `None` when the peer closed the connection between frames.
pub async fn read_frame<R>(r: &mut R) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {len} exceeds limit {MAX_FRAME_SIZE}"),
        ));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    Ok(Some(Bytes::from(data)))
}

/// The sending half of one TCP connection.
#[derive(Debug)]
pub struct TcpTransport {
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    close: watch::Sender<bool>,
}

impl TcpTransport {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, msg: &ClusterMessage) -> Result<(), ClusterError> {
        if *self.close.borrow() {
            return Err(ClusterError::LinkClosed);
        }
        self.tx.try_send(msg.encode()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ClusterError::Transport(format!("send queue to {} is full", self.peer))
            }
            mpsc::error::TrySendError::Closed(_) => ClusterError::LinkClosed,
        })
    }

    fn disconnect(&self) {
        self.close.send_replace(true);
    }
}

/// An open connection: the transport handed to the bus plus the read half,
/// which [`Connection::serve`] drives.
#[derive(Debug)]
pub struct Connection {
    transport: Arc<TcpTransport>,
    reader: OwnedReadHalf,
    closed: watch::Receiver<bool>,
}

impl Connection {
    /// Wraps `stream` and starts its writer task.
    pub fn open(stream: TcpStream, peer: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY for {peer}: {e}");
        }
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (close, closed) = watch::channel(false);
        tokio::spawn(write_loop(writer, rx, closed.clone(), peer));
        Self {
            transport: Arc::new(TcpTransport { peer, tx, close }),
            reader,
            closed,
        }
    }

    /// Dials `addr`, giving up after `timeout`.
    pub async fn dial(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        Ok(Self::open(stream, addr))
    }

    pub fn transport(&self) -> Arc<TcpTransport> {
        Arc::clone(&self.transport)
    }

    /// Feeds every decoded frame to the bus until the peer goes away or the
    /// link is freed, then tells the bus the link is gone.
    pub async fn serve(self, bus: Arc<ClusterBus>, link: Arc<Link>) {
        let Connection {
            transport,
            mut reader,
            mut closed,
        } = self;
        let peer = transport.peer();

        loop {
            let frame = tokio::select! {
                biased;
                _ = async { let _ = closed.wait_for(|closed| *closed).await; } => break,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(Some(bytes)) => match ClusterMessage::decode(&bytes) {
                    Ok(msg) => bus.handle_message(&link, msg).await,
                    Err(e) => debug!("dropping undecodable frame from {peer}: {e}"),
                },
                Ok(None) => {
                    debug!("connection to {peer} closed by peer");
                    break;
                }
                Err(e) => {
                    debug!("read from {peer} failed: {e}");
                    break;
                }
            }
        }

        transport.disconnect();
        bus.link_closed(&link).await;
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    mut closed: watch::Receiver<bool>,
    peer: SocketAddr,
) {
    loop {
        tokio::select! {
            biased;
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("write to {peer} failed: {e}");
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}
