mod config;
mod server;
mod transport;

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use watchdog_cluster::ProtocolVersion;

use crate::config::ServerConfig;

#[derive(Parser)]
#[command(name = "watchdog-server", about = "cluster bus node: gossip, failure detection and failover")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "WATCHDOG_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address the bus listener binds to
    #[arg(long, env = "WATCHDOG_BIND")]
    bind: Option<String>,

    /// IP announced to peers
    #[arg(long, env = "WATCHDOG_ANNOUNCE_IP")]
    announce_ip: Option<IpAddr>,

    /// client port announced to peers
    #[arg(short, long, env = "WATCHDOG_PORT")]
    port: Option<u16>,

    /// cluster bus port, both announced and listened on. default: port + 10000
    #[arg(long, env = "WATCHDOG_BUS_PORT")]
    bus_port: Option<u16>,

    /// node name (UUID). a fresh one is generated when unset
    #[arg(long, env = "WATCHDOG_NODE_ID")]
    node_id: Option<String>,

    /// milliseconds without a PONG before a peer is suspected
    #[arg(long, env = "WATCHDOG_NODE_TIMEOUT")]
    node_timeout: Option<u64>,

    /// bus protocol version: v0 or v1
    #[arg(long, env = "WATCHDOG_PROTOCOL_VERSION")]
    protocol_version: Option<String>,

    /// slots owned at startup, e.g. "0-5460". repeatable
    #[arg(long = "slots", env = "WATCHDOG_SLOTS", value_delimiter = ',')]
    slots: Vec<String>,

    /// name of the primary to replicate
    #[arg(long, env = "WATCHDOG_REPLICA_OF")]
    replica_of: Option<String>,

    /// peer to meet at startup, as ip:port@busport. repeatable
    #[arg(long = "meet", env = "WATCHDOG_MEET", value_delimiter = ',')]
    meet: Vec<String>,
}

/// Applies CLI and environment overrides on top of the file config.
fn apply_args(cfg: &mut ServerConfig, args: &Args) {
    if let Some(ref bind) = args.bind {
        cfg.bind = bind.clone();
    }
    if let Some(ip) = args.announce_ip {
        cfg.cluster.announce_ip = ip;
    }
    if let Some(port) = args.port {
        cfg.cluster.announce_port = port;
        if args.bus_port.is_none() {
            cfg.cluster.announce_bus_port = port.saturating_add(10000);
        }
    }
    if let Some(bus_port) = args.bus_port {
        cfg.cluster.announce_bus_port = bus_port;
    }
    if let Some(ref id) = args.node_id {
        cfg.node_id = id.clone();
    }
    if let Some(ms) = args.node_timeout {
        cfg.cluster.node_timeout = Duration::from_millis(ms);
    }
    if !args.slots.is_empty() {
        cfg.slots = args.slots.clone();
    }
    if let Some(ref primary) = args.replica_of {
        cfg.replica_of = primary.clone();
    }
    if !args.meet.is_empty() {
        cfg.meet = args.meet.clone();
    }
}

fn parse_protocol_version(s: &str) -> Result<ProtocolVersion, String> {
    match s.to_ascii_lowercase().as_str() {
        "v0" | "0" => Ok(ProtocolVersion::V0),
        "v1" | "1" => Ok(ProtocolVersion::V1),
        other => Err(format!("unknown protocol version '{other}' (expected v0 or v1)")),
    }
}

fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchdog=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match ServerConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                return Ok(());
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => ServerConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => ServerConfig::default(),
    };
    apply_args(&mut cfg, &args);
    if let Some(ref version) = args.protocol_version {
        cfg.cluster.protocol_version =
            parse_protocol_version(version).unwrap_or_else(|e| exit_err(e));
    }
    if let Err(e) = cfg.cluster.validate() {
        exit_err(e);
    }

    info!(
        "watchdog-server {} starting (node timeout {:?})",
        env!("CARGO_PKG_VERSION"),
        cfg.cluster.node_timeout
    );
    server::run(cfg).await
}
