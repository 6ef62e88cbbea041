//! Cluster bus configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ClusterError;

/// Wire protocol version, which also selects the gossip sampling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Purely random sampling, biased toward failing nodes early on.
    V0,
    /// Random sampling of healthy nodes plus every PFAIL node.
    #[default]
    V1,
}

impl ProtocolVersion {
    pub fn as_u16(self) -> u16 {
        match self {
            ProtocolVersion::V0 => 0,
            ProtocolVersion::V1 => 1,
        }
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(ProtocolVersion::V0),
            1 => Some(ProtocolVersion::V1),
            _ => None,
        }
    }
}

/// Configuration for the gossip, failure detection and failover engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Protocol version spoken on the bus.
    pub protocol_version: ProtocolVersion,
    /// IP announced to peers in every message header.
    pub announce_ip: IpAddr,
    /// Client port announced to peers.
    pub announce_port: u16,
    /// Bus port announced to peers.
    pub announce_bus_port: u16,
    /// A peer that hasn't answered a PING for this long becomes PFAIL.
    #[serde(with = "millis")]
    pub node_timeout: Duration,
    /// A PFAIL peer silent for `node_timeout * fail_confirm_mult` is failed
    /// locally without waiting for a quorum. Zero disables local promotion.
    pub fail_confirm_mult: u32,
    /// Fail reports expire after `node_timeout * fail_report_validity_mult`.
    pub fail_report_validity_mult: u32,
    /// A failed primary that still owns slots needs to stay FAIL for
    /// `node_timeout * fail_undo_mult` before a PONG can clear the flag.
    pub fail_undo_mult: u32,
    /// How often the periodic tick runs.
    #[serde(with = "millis")]
    pub tick_interval: Duration,
    /// How long a replica collects failover votes before giving up.
    /// Defaults to `max(2 * node_timeout, 2s)` when zero.
    #[serde(with = "millis")]
    pub failover_auth_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V1,
            announce_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announce_port: 6379,
            announce_bus_port: 16379,
            node_timeout: Duration::from_secs(15),
            fail_confirm_mult: 4,
            fail_report_validity_mult: 2,
            fail_undo_mult: 2,
            tick_interval: Duration::from_millis(100),
            failover_auth_timeout: Duration::ZERO,
        }
    }
}

impl ClusterConfig {
    /// Validates the configuration, returning an error for invalid values.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.node_timeout.is_zero() {
            return Err(ClusterError::Configuration(
                "node_timeout must be > 0".into(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(ClusterError::Configuration(
                "tick_interval must be > 0".into(),
            ));
        }
        if self.fail_report_validity_mult == 0 {
            return Err(ClusterError::Configuration(
                "fail_report_validity_mult must be > 0".into(),
            ));
        }
        if self.fail_confirm_mult == 1 {
            return Err(ClusterError::Configuration(
                "fail_confirm_mult must be 0 (disabled) or > 1".into(),
            ));
        }
        if self.announce_port == 0 || self.announce_bus_port == 0 {
            return Err(ClusterError::Configuration(
                "announced ports must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Client address announced to peers.
    pub fn announce_addr(&self) -> SocketAddr {
        SocketAddr::new(self.announce_ip, self.announce_port)
    }

    pub fn node_timeout_ms(&self) -> u64 {
        crate::time::millis(self.node_timeout)
    }

    /// Window during which a fail report counts toward quorum.
    pub fn fail_report_validity_ms(&self) -> u64 {
        self.node_timeout_ms()
            .saturating_mul(self.fail_report_validity_mult as u64)
    }

    /// Local hard deadline for SUSPECTED → FAILED, if enabled.
    pub fn fail_confirm_ms(&self) -> Option<u64> {
        match self.fail_confirm_mult {
            0 => None,
            mult => Some(self.node_timeout_ms().saturating_mul(mult as u64)),
        }
    }

    pub fn fail_undo_ms(&self) -> u64 {
        self.node_timeout_ms()
            .saturating_mul(self.fail_undo_mult as u64)
    }

    pub fn failover_auth_timeout_ms(&self) -> u64 {
        if self.failover_auth_timeout.is_zero() {
            self.node_timeout_ms().saturating_mul(2).max(2000)
        } else {
            crate::time::millis(self.failover_auth_timeout)
        }
    }
}

/// Serializes durations as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
