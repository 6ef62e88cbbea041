//! Binary wire format for cluster bus messages.
//!
//! Every message starts with the same fixed header describing the sender
//! (identity, address, flags, epochs, slot bitmap), followed by a tagged
//! payload. All multi-byte integers are little-endian.

use std::io::{self, Read};
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::ProtocolVersion;
use crate::node::{NodeFlags, NodeRole};
use crate::slots::{SlotBitmap, SLOT_BITMAP_LEN};
use crate::NodeId;

/// Magic bytes at the start of every message.
pub const SIGNATURE: &[u8; 4] = b"RCmb";

/// Upper bound on gossip entries in one message.
/// Prevents allocation bombs from crafted messages.
pub const MAX_GOSSIP_ENTRIES: usize = 1024;

// Flag bits as they travel on the wire. Nothing outside this module deals
// with raw bits; the engine works with `NodeFlags` and `NodeRole`.
const FLAG_MYSELF: u16 = 1 << 0;
const FLAG_MASTER: u16 = 1 << 1;
const FLAG_SLAVE: u16 = 1 << 2;
const FLAG_PFAIL: u16 = 1 << 3;
const FLAG_FAIL: u16 = 1 << 4;
const FLAG_HANDSHAKE: u16 = 1 << 5;
const FLAG_NOADDR: u16 = 1 << 6;
const FLAG_MEET: u16 = 1 << 7;

const PAYLOAD_EMPTY: u8 = 0;
const PAYLOAD_GOSSIP: u8 = 1;
const PAYLOAD_FAIL: u8 = 2;
const PAYLOAD_UPDATE: u8 = 3;

// Safe read helpers that return io::Error instead of panicking on truncated input.

fn safe_get_u8(buf: &mut &[u8]) -> io::Result<u8> {
    if buf.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 1 byte"));
    }
    Ok(buf.get_u8())
}

fn safe_get_u16_le(buf: &mut &[u8]) -> io::Result<u16> {
    if buf.len() < 2 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 2 bytes"));
    }
    Ok(buf.get_u16_le())
}

fn safe_get_u64_le(buf: &mut &[u8]) -> io::Result<u64> {
    if buf.len() < 8 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 8 bytes"));
    }
    Ok(buf.get_u64_le())
}

/// Bus message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Heartbeat carrying a gossip section. Expects a PONG.
    Ping,
    /// Reply to PING or MEET, also broadcast to announce config changes.
    Pong,
    /// Like PING, but forces the receiver to add the sender.
    Meet,
    /// Announces that a node is FAIL.
    Fail,
    /// Tells a node its view of some slots is outdated.
    Update,
    /// A replica asking primaries to vote for it.
    FailoverAuthRequest,
    /// A primary's vote.
    FailoverAuthAck,
}

impl MessageType {
    /// Every message type, in wire order.
    pub const ALL: [MessageType; 7] = [
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Meet,
        MessageType::Fail,
        MessageType::Update,
        MessageType::FailoverAuthRequest,
        MessageType::FailoverAuthAck,
    ];

    pub fn as_u16(self) -> u16 {
        match self {
            MessageType::Ping => 0,
            MessageType::Pong => 1,
            MessageType::Meet => 2,
            MessageType::Fail => 3,
            MessageType::Update => 4,
            MessageType::FailoverAuthRequest => 5,
            MessageType::FailoverAuthAck => 6,
        }
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    /// True for the heartbeat types that carry a gossip section.
    pub fn carries_gossip(self) -> bool {
        matches!(
            self,
            MessageType::Ping | MessageType::Pong | MessageType::Meet
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Meet => "meet",
            MessageType::Fail => "fail",
            MessageType::Update => "update",
            MessageType::FailoverAuthRequest => "auth-req",
            MessageType::FailoverAuthAck => "auth-ack",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Cluster health as seen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterHealth {
    /// Every slot is served by a reachable primary.
    Ok,
    #[default]
    Fail,
}

impl std::fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterHealth::Ok => write!(f, "ok"),
            ClusterHealth::Fail => write!(f, "fail"),
        }
    }
}

/// The sender's digest of one other node.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipEntry {
    pub node: NodeId,
    pub addr: SocketAddr,
    pub bus_port: u16,
    pub flags: NodeFlags,
    pub is_primary: bool,
    pub ping_sent: u64,
    pub pong_received: u64,
}

/// Type-specific message body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MessagePayload {
    #[default]
    Empty,
    /// PING, PONG and MEET.
    Gossip(Vec<GossipEntry>),
    /// FAIL: the node that failed.
    Fail { node: NodeId },
    /// UPDATE: the current owner of some slots and its config.
    Update {
        node: NodeId,
        config_epoch: u64,
        slots: SlotBitmap,
    },
}

/// One message on the cluster bus.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMessage {
    pub version: ProtocolVersion,
    pub kind: MessageType,
    pub sender: NodeId,
    /// Sender's client address.
    pub addr: SocketAddr,
    pub bus_port: u16,
    pub flags: NodeFlags,
    /// Sender's role. A replica also names its primary here.
    pub role: NodeRole,
    pub state: ClusterHealth,
    /// Slots the sender owns, or its primary's slots if it is a replica.
    pub slots: SlotBitmap,
    pub current_epoch: u64,
    /// Sender's config epoch, or its primary's if it is a replica.
    pub config_epoch: u64,
    /// Replication offset. Zero for primaries.
    pub offset: u64,
    pub payload: MessagePayload,
}

impl ClusterMessage {
    /// The gossip section, empty for types that don't carry one.
    pub fn gossip(&self) -> &[GossipEntry] {
        match &self.payload {
            MessagePayload::Gossip(entries) => entries,
            _ => &[],
        }
    }

    /// The primary named by a replica sender.
    pub fn primary(&self) -> Option<NodeId> {
        match self.role {
            NodeRole::Replica { primary } => primary,
            NodeRole::Primary => None,
        }
    }

    pub fn sender_is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }

    /// Serializes the message to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2048 + 128);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Serializes the message into the given buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(SIGNATURE);
        buf.put_u16_le(self.version.as_u16());
        buf.put_u16_le(self.kind.as_u16());
        encode_node_id(buf, &self.sender);
        encode_socket_addr(buf, &self.addr);
        buf.put_u16_le(self.bus_port);
        buf.put_u16_le(flags_to_bits(&self.flags, self.role == NodeRole::Primary));
        match self.primary() {
            Some(id) => encode_node_id(buf, &id),
            None => buf.put_slice(uuid::Uuid::nil().as_bytes()),
        }
        buf.put_u8(match self.state {
            ClusterHealth::Ok => 0,
            ClusterHealth::Fail => 1,
        });
        buf.put_u64_le(self.current_epoch);
        buf.put_u64_le(self.config_epoch);
        buf.put_u64_le(self.offset);
        buf.put_slice(self.slots.as_bytes());

        match &self.payload {
            MessagePayload::Empty => buf.put_u8(PAYLOAD_EMPTY),
            MessagePayload::Gossip(entries) => {
                buf.put_u8(PAYLOAD_GOSSIP);
                let count = entries.len().min(MAX_GOSSIP_ENTRIES);
                buf.put_u16_le(count as u16);
                for entry in &entries[..count] {
                    encode_gossip_entry(buf, entry);
                }
            }
            MessagePayload::Fail { node } => {
                buf.put_u8(PAYLOAD_FAIL);
                encode_node_id(buf, node);
            }
            MessagePayload::Update {
                node,
                config_epoch,
                slots,
            } => {
                buf.put_u8(PAYLOAD_UPDATE);
                encode_node_id(buf, node);
                buf.put_u64_le(*config_epoch);
                buf.put_slice(slots.as_bytes());
            }
        }
    }

    /// Deserializes a message from bytes.
    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        if buf.len() < SIGNATURE.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "message shorter than signature",
            ));
        }
        let mut sig = [0u8; 4];
        buf.read_exact(&mut sig)?;
        if &sig != SIGNATURE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad message signature",
            ));
        }

        let raw_version = safe_get_u16_le(&mut buf)?;
        let version = ProtocolVersion::from_u16(raw_version).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported protocol version: {raw_version}"),
            )
        })?;
        let raw_type = safe_get_u16_le(&mut buf)?;
        let kind = MessageType::from_u16(raw_type).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message type: {raw_type}"),
            )
        })?;
        let sender = decode_node_id(&mut buf)?;
        let addr = decode_socket_addr(&mut buf)?;
        let bus_port = safe_get_u16_le(&mut buf)?;
        let bits = safe_get_u16_le(&mut buf)?;
        let primary = decode_node_id(&mut buf)?;
        let (flags, is_primary) = bits_to_flags(bits);
        let role = if is_primary {
            NodeRole::Primary
        } else {
            NodeRole::Replica {
                primary: (!primary.0.is_nil()).then_some(primary),
            }
        };
        let state = match safe_get_u8(&mut buf)? {
            0 => ClusterHealth::Ok,
            1 => ClusterHealth::Fail,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown cluster state: {other}"),
                ))
            }
        };
        let current_epoch = safe_get_u64_le(&mut buf)?;
        let config_epoch = safe_get_u64_le(&mut buf)?;
        let offset = safe_get_u64_le(&mut buf)?;
        let slots = decode_slot_bitmap(&mut buf)?;

        let payload = match safe_get_u8(&mut buf)? {
            PAYLOAD_EMPTY => MessagePayload::Empty,
            PAYLOAD_GOSSIP => {
                let count = safe_get_u16_le(&mut buf)? as usize;
                if count > MAX_GOSSIP_ENTRIES {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("gossip count {count} exceeds limit"),
                    ));
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(decode_gossip_entry(&mut buf)?);
                }
                MessagePayload::Gossip(entries)
            }
            PAYLOAD_FAIL => MessagePayload::Fail {
                node: decode_node_id(&mut buf)?,
            },
            PAYLOAD_UPDATE => {
                let node = decode_node_id(&mut buf)?;
                let config_epoch = safe_get_u64_le(&mut buf)?;
                let slots = decode_slot_bitmap(&mut buf)?;
                MessagePayload::Update {
                    node,
                    config_epoch,
                    slots,
                }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown payload type: {other}"),
                ))
            }
        };

        Ok(ClusterMessage {
            version,
            kind,
            sender,
            addr,
            bus_port,
            flags,
            role,
            state,
            slots,
            current_epoch,
            config_epoch,
            offset,
            payload,
        })
    }
}

fn flags_to_bits(flags: &NodeFlags, is_primary: bool) -> u16 {
    let mut bits = if is_primary { FLAG_MASTER } else { FLAG_SLAVE };
    for (set, bit) in [
        (flags.myself, FLAG_MYSELF),
        (flags.pfail, FLAG_PFAIL),
        (flags.fail, FLAG_FAIL),
        (flags.handshake, FLAG_HANDSHAKE),
        (flags.noaddr, FLAG_NOADDR),
        (flags.meet, FLAG_MEET),
    ] {
        if set {
            bits |= bit;
        }
    }
    bits
}

/// Decodes wire flag bits. The second value is true for a primary.
fn bits_to_flags(bits: u16) -> (NodeFlags, bool) {
    let flags = NodeFlags {
        myself: bits & FLAG_MYSELF != 0,
        pfail: bits & FLAG_PFAIL != 0,
        fail: bits & FLAG_FAIL != 0,
        handshake: bits & FLAG_HANDSHAKE != 0,
        noaddr: bits & FLAG_NOADDR != 0,
        meet: bits & FLAG_MEET != 0,
        failover_auth: false,
    };
    // a node is a primary unless it says it's a replica
    (flags, bits & FLAG_SLAVE == 0)
}

fn encode_node_id(buf: &mut BytesMut, id: &NodeId) {
    buf.put_slice(id.0.as_bytes());
}

fn decode_node_id(buf: &mut &[u8]) -> io::Result<NodeId> {
    if buf.len() < 16 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "not enough bytes for node id",
        ));
    }
    let mut bytes = [0u8; 16];
    buf.read_exact(&mut bytes)?;
    Ok(NodeId(uuid::Uuid::from_bytes(bytes)))
}

fn decode_slot_bitmap(buf: &mut &[u8]) -> io::Result<SlotBitmap> {
    if buf.len() < SLOT_BITMAP_LEN {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "not enough bytes for slot bitmap",
        ));
    }
    let mut bytes = [0u8; SLOT_BITMAP_LEN];
    buf.read_exact(&mut bytes)?;
    Ok(SlotBitmap::from_bytes(bytes))
}

fn encode_socket_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16_le(v4.port());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16_le(v6.port());
        }
    }
}

fn decode_socket_addr(buf: &mut &[u8]) -> io::Result<SocketAddr> {
    let addr_type = safe_get_u8(buf)?;
    match addr_type {
        4 => {
            if buf.len() < 6 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "not enough bytes for ipv4 address",
                ));
            }
            let mut octets = [0u8; 4];
            buf.read_exact(&mut octets)?;
            let port = buf.get_u16_le();
            Ok(SocketAddr::from((octets, port)))
        }
        6 => {
            if buf.len() < 18 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "not enough bytes for ipv6 address",
                ));
            }
            let mut octets = [0u8; 16];
            buf.read_exact(&mut octets)?;
            let port = buf.get_u16_le();
            Ok(SocketAddr::from((octets, port)))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown address type: {other}"),
        )),
    }
}

fn encode_gossip_entry(buf: &mut BytesMut, entry: &GossipEntry) {
    encode_node_id(buf, &entry.node);
    encode_socket_addr(buf, &entry.addr);
    buf.put_u16_le(entry.bus_port);
    buf.put_u16_le(flags_to_bits(&entry.flags, entry.is_primary));
    buf.put_u64_le(entry.ping_sent);
    buf.put_u64_le(entry.pong_received);
}

fn decode_gossip_entry(buf: &mut &[u8]) -> io::Result<GossipEntry> {
    let node = decode_node_id(buf)?;
    let addr = decode_socket_addr(buf)?;
    let bus_port = safe_get_u16_le(buf)?;
    let (flags, is_primary) = bits_to_flags(safe_get_u16_le(buf)?);
    let ping_sent = safe_get_u64_le(buf)?;
    let pong_received = safe_get_u64_le(buf)?;
    Ok(GossipEntry {
        node,
        addr,
        bus_port,
        flags,
        is_primary,
        ping_sent,
        pong_received,
    })
}
