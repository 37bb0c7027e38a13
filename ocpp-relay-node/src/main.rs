//! OCPP Relay Node - CLI for an OCPP networking node
//!
//! One process that accepts stations, connects to a CSMS (or another
//! networking node) and relays between them.
//!
//! # Usage
//!
//! ```bash
//! # Local controller between stations and a CSMS
//! ocpp-relay-node --name LC1 --listen 0.0.0.0:9000 \
//!     --upstream ws://csms.example.com/ocpp --upstream-id CSMS-1
//!
//! # A CSMS that answers BootNotification/Heartbeat itself
//! ocpp-relay-node --name CSMS-1 --csms --listen 0.0.0.0:8180
//!
//! # Settings from a file, flags win
//! ocpp-relay-node --config node.json --log-level debug
//! ```
//!
//! # Config file
//!
//! ```json
//! {
//!   "node_id": "LC1",
//!   "listen": "0.0.0.0:9000",
//!   "upstream": "ws://csms.example.com/ocpp",
//!   "upstream_id": "CSMS-1",
//!   "upstream_profile": "routed",
//!   "default_forwarding": "forward",
//!   "static_routes": { "CS042": "LC2" }
//! }
//! ```

use clap::Parser;
use ocpp_relay_core::{ForwardingOutcome, FrameProfile, NetworkingNode, NodeConfig};
use ocpp_relay_ws::{csms_handlers, standard_registry, CsmsDefaults, WsConfig, WsTransport};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP networking node: station server, CSMS client and relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identifier
    #[arg(short, long)]
    name: Option<String>,

    /// Act as the CSMS at the root of the tree
    #[arg(long)]
    csms: bool,

    /// Address to accept downstream WebSocket connections on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Upstream WebSocket URL (the node id is appended as last path segment)
    #[arg(long)]
    upstream: Option<String>,

    /// Node id of the upstream peer
    #[arg(long)]
    upstream_id: Option<String>,

    /// Framing toward the upstream peer (standard, routed)
    #[arg(long, value_parser = parse_profile)]
    upstream_profile: Option<FrameProfile>,

    /// Decision for transiting requests no voter decides (forward, reject, drop)
    #[arg(long)]
    default_forwarding: Option<ForwardingOutcome>,

    /// Let requests for unknown actions transit
    #[arg(long)]
    forward_unknown_actions: bool,

    /// Request timeout in seconds
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Static route DEST=VIA (can be repeated)
    #[arg(long = "static-route", value_parser = parse_route)]
    static_routes: Vec<(String, String)>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("No node id given (use --name or node_id in the config file)")]
    MissingNodeId,

    #[error("Nothing to run: configure a listen address or an upstream URL")]
    NothingToRun,
}

/// Settings loaded from `--config`
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
struct NodeFileConfig {
    node_id: Option<String>,
    csms: bool,
    listen: Option<SocketAddr>,
    upstream: Option<String>,
    upstream_id: Option<String>,
    upstream_profile: Option<FrameProfile>,
    default_forwarding: Option<ForwardingOutcome>,
    forward_unknown_actions: bool,
    request_timeout_secs: Option<u64>,
    static_routes: BTreeMap<String, String>,
    heartbeat_interval: Option<i32>,
    accepted_vendors: Vec<String>,
}

impl NodeFileConfig {
    fn load(path: &Path) -> Result<Self, CliError> {
        let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| CliError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Everything needed to start the node
#[derive(Debug)]
struct Settings {
    node: NodeConfig,
    ws: WsConfig,
    csms_defaults: CsmsDefaults,
}

impl Settings {
    /// Merge file and flags; flags win
    fn resolve(args: &Args, file: NodeFileConfig) -> Result<Self, CliError> {
        let node_id = args.name.clone().or(file.node_id).ok_or(CliError::MissingNodeId)?;

        let mut node = NodeConfig::new(node_id);
        if args.csms || file.csms {
            node = node.as_csms();
        }
        if let Some(outcome) = args.default_forwarding.or(file.default_forwarding) {
            node = node.with_default_forwarding(outcome);
        }
        if args.forward_unknown_actions || file.forward_unknown_actions {
            node = node.with_forward_unknown_actions(true);
        }
        if let Some(secs) = args.request_timeout.or(file.request_timeout_secs) {
            node = node.with_request_timeout(Duration::from_secs(secs));
        }
        for (destination, via) in file.static_routes {
            if args.static_routes.iter().any(|(dest, _)| *dest == destination) {
                continue;
            }
            node = node.with_static_route(destination, via);
        }
        for (destination, via) in &args.static_routes {
            node = node.with_static_route(destination.as_str(), via.as_str());
        }

        let mut ws = WsConfig::new();
        if let Some(addr) = args.listen.or(file.listen) {
            ws = ws.with_listen_addr(addr);
        }
        if let Some(url) = args.upstream.clone().or(file.upstream) {
            ws = ws.with_upstream(url);
        }
        if let Some(id) = args.upstream_id.clone().or(file.upstream_id) {
            ws = ws.with_upstream_id(id);
        }
        if let Some(profile) = args.upstream_profile.or(file.upstream_profile) {
            ws = ws.with_upstream_profile(profile);
        }

        let mut csms_defaults = CsmsDefaults {
            accepted_vendors: file.accepted_vendors,
            ..Default::default()
        };
        if let Some(interval) = file.heartbeat_interval {
            csms_defaults.heartbeat_interval = interval;
        }

        Ok(Self {
            node,
            ws,
            csms_defaults,
        })
    }
}

fn parse_profile(s: &str) -> Result<FrameProfile, String> {
    match s.to_ascii_lowercase().as_str() {
        "standard" | "ocpp2.0.1" => Ok(FrameProfile::Standard),
        "routed" | "ocpp2.1" => Ok(FrameProfile::Routed),
        other => Err(format!("unknown framing profile: {}", other)),
    }
}

fn parse_route(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((dest, via)) if !dest.is_empty() && !via.is_empty() => Ok((dest.to_string(), via.to_string())),
        _ => Err(format!("expected DEST=VIA, got {}", s)),
    }
}

fn level_filter(log_level: &str) -> &'static str {
    match log_level {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging; RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_filter(&args.log_level)));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let file = match &args.config {
        Some(path) => NodeFileConfig::load(path)?,
        None => NodeFileConfig::default(),
    };
    let settings = Settings::resolve(&args, file)?;
    if settings.ws.listen_addr.is_none() && settings.ws.upstream_url.is_none() {
        return Err(CliError::NothingToRun.into());
    }

    // Print banner
    let role = if settings.node.is_csms { "CSMS" } else { "networking node" };
    let listen = settings
        .ws
        .listen_addr
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    let upstream = settings.ws.upstream_url.clone().unwrap_or_else(|| "-".to_string());
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP Relay Node - Networking Node               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", truncate(settings.node.node_id.as_str(), 50));
    println!("║  Role:     {:<50} ║", role);
    println!("║  Listen:   {:<50} ║", truncate(&listen, 50));
    println!("║  Upstream: {:<50} ║", truncate(&upstream, 50));
    println!("║  Policy:   {:<50} ║", settings.node.default_forwarding.to_string());
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let transport = WsTransport::new(settings.ws.clone());
    let builder = NetworkingNode::builder(settings.node.clone());
    let builder = if settings.node.is_csms {
        csms_handlers(builder, settings.csms_defaults)
    } else {
        builder.with_registry(standard_registry())
    };
    let node = builder.build(transport.clone())?;
    let maintenance = node.spawn_maintenance();

    let mut tasks = JoinSet::new();
    if settings.ws.upstream_url.is_some() {
        tasks.spawn(transport.clone().run_upstream(node.clone()));
    }
    if settings.ws.listen_addr.is_some() {
        tasks.spawn(transport.clone().serve(node.clone()));
    }

    info!("Node {} running", node.id());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        Some(joined) = tasks.join_next() => match joined {
            Ok(Ok(())) => warn!("Transport task finished"),
            Ok(Err(e)) => error!("Transport failed: {}", e),
            Err(e) => error!("Transport task aborted: {}", e),
        },
    }

    node.shutdown();
    tasks.abort_all();
    let _ = maintenance.await;

    Ok(())
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
