//! Server configuration: defaults, then an optional TOML file, then CLI
//! flags and environment variables.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use watchdog_cluster::{
    ClusterConfig, ClusterNode, NodeId, NodeRole, SlotBitmap, SlotRange, SLOT_COUNT,
};

/// Everything the server reads at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the cluster bus listener binds to. The port is taken from
    /// `cluster.announce_bus_port`.
    pub bind: String,
    /// This node's name. A fresh one is generated when empty.
    pub node_id: String,
    /// Slots this node owns at startup, e.g. `["0-5460", "9000"]`.
    pub slots: Vec<String>,
    /// Name of the primary to replicate. Empty for a primary.
    pub replica_of: String,
    /// Peers to meet at startup, as `ip:port@busport`.
    pub meet: Vec<String>,
    /// Engine settings.
    pub cluster: ClusterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            node_id: String::new(),
            slots: Vec::new(),
            replica_of: String::new(),
            meet: Vec::new(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        toml::from_str(&text)
            .map_err(|e| format!("failed to parse config file '{}': {e}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// The address the bus listener binds to.
    pub fn bus_bind_addr(&self) -> Result<SocketAddr, String> {
        let port = self.cluster.announce_bus_port;
        format!("{}:{port}", self.bind)
            .parse()
            .map_err(|e| format!("invalid bind address '{}:{port}': {e}", self.bind))
    }

    /// Builds the local node record from the configured name, role and
    /// slots.
    pub fn local_node(&self) -> Result<ClusterNode, String> {
        let id = if self.node_id.is_empty() {
            NodeId::new()
        } else {
            NodeId::parse(&self.node_id)
                .map_err(|e| format!("invalid node_id '{}': {e}", self.node_id))?
        };
        let mut node = ClusterNode::new_primary(
            id,
            self.cluster.announce_addr(),
            self.cluster.announce_bus_port,
        );

        if !self.replica_of.is_empty() {
            if !self.slots.is_empty() {
                return Err("a replica can't own slots".into());
            }
            let primary = NodeId::parse(&self.replica_of)
                .map_err(|e| format!("invalid replica_of '{}': {e}", self.replica_of))?;
            node.role = NodeRole::Replica {
                primary: Some(primary),
            };
            return Ok(node);
        }

        let ranges = self
            .slots
            .iter()
            .map(|s| parse_slot_range(s))
            .collect::<Result<Vec<_>, _>>()?;
        node.slots = SlotBitmap::from_ranges(&ranges);
        Ok(node)
    }

    /// The peers listed under `meet`.
    pub fn seeds(&self) -> Result<Vec<(SocketAddr, u16)>, String> {
        self.meet.iter().map(|s| parse_meet_addr(s)).collect()
    }
}

/// Parses `"start-end"` or a single slot.
pub fn parse_slot_range(input: &str) -> Result<SlotRange, String> {
    let parse = |s: &str| {
        s.trim()
            .parse::<u16>()
            .ok()
            .filter(|slot| *slot < SLOT_COUNT)
            .ok_or_else(|| format!("invalid slot '{s}' (must be 0-{})", SLOT_COUNT - 1))
    };
    let (start, end) = match input.split_once('-') {
        Some((start, end)) => (parse(start)?, parse(end)?),
        None => {
            let slot = parse(input)?;
            (slot, slot)
        }
    };
    if start > end {
        return Err(format!("invalid slot range '{input}': start > end"));
    }
    Ok(SlotRange::new(start, end))
}

/// Parses `ip:port@busport`. Without `@busport` the bus port is the client
/// port plus 10000.
pub fn parse_meet_addr(input: &str) -> Result<(SocketAddr, u16), String> {
    let (addr, bus) = match input.split_once('@') {
        Some((addr, bus)) => (addr, Some(bus)),
        None => (input, None),
    };
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| format!("invalid meet address '{input}': {e}"))?;
    let bus_port = match bus {
        Some(bus) => bus
            .parse::<u16>()
            .map_err(|e| format!("invalid bus port in '{input}': {e}"))?,
        None => addr
            .port()
            .checked_add(10000)
            .ok_or_else(|| format!("no bus port for '{input}': client port too high"))?,
    };
    Ok((addr, bus_port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use watchdog_cluster::ProtocolVersion;

    #[test]
    fn parse_slots() {
        assert_eq!(parse_slot_range("0-5460").unwrap(), SlotRange::new(0, 5460));
        assert_eq!(parse_slot_range("42").unwrap(), SlotRange::new(42, 42));
        assert!(parse_slot_range("10-5").is_err());
        assert!(parse_slot_range("16384").is_err());
        assert!(parse_slot_range("x").is_err());
    }

    #[test]
    fn parse_meet() {
        let (addr, bus) = parse_meet_addr("10.0.0.2:6379@16400").unwrap();
        assert_eq!(addr, "10.0.0.2:6379".parse::<SocketAddr>().unwrap());
        assert_eq!(bus, 16400);
        assert_eq!(parse_meet_addr("10.0.0.2:7000").unwrap().1, 17000);
        assert!(parse_meet_addr("10.0.0.2:60000").is_err());
        assert!(parse_meet_addr("nope").is_err());
    }

    #[test]
    fn toml_overlay_keeps_defaults() {
        let cfg: ServerConfig = toml::from_str(
            r#"
            slots = ["0-99"]

            [cluster]
            protocol_version = "v0"
            node_timeout = 2000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.cluster.protocol_version, ProtocolVersion::V0);
        assert_eq!(cfg.cluster.node_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.cluster.tick_interval, Duration::from_millis(100));
        assert_eq!(cfg.local_node().unwrap().slot_count(), 100);
    }

    #[test]
    fn template_roundtrips() {
        let text = ServerConfig::default().to_toml().unwrap();
        let back: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.cluster.node_timeout, Duration::from_secs(15));
    }

    #[test]
    fn replica_config() {
        let primary = NodeId::new();
        let cfg = ServerConfig {
            replica_of: primary.0.to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(cfg.local_node().unwrap().primary_id(), Some(primary));

        let bad = ServerConfig {
            slots: vec!["1".into()],
            ..cfg
        };
        assert!(bad.local_node().is_err());
    }
}
