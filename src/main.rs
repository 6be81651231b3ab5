//! Glacier node — connection layer binary
//!
//! Runs the peer layer standalone: listens, dials seeds, completes
//! handshakes and gossips validator addresses. Consensus traffic is parsed
//! and discarded (no engine is attached).

mod net;
mod types;
mod version;

use crate::net::{IpPort, NetConfig, Network, NoopRouter, DEFAULT_PORT};
use crate::types::NodeId;
use crate::version::AppVersion;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "glacier", version, about = "Glacier: consensus network node")]
struct Args {
    /// Listen port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Network id
    #[arg(short, long, default_value_t = 1)]
    network_id: u32,

    /// Publicly reachable IP address to advertise
    #[arg(short = 'e', long)]
    external_ip: Option<IpAddr>,

    /// Seed nodes (comma-separated ip:port)
    #[arg(short, long)]
    seeds: Option<String>,

    /// Beacon peer addresses (comma-separated ip:port); beacons get relaxed
    /// version-compatibility treatment
    #[arg(short, long)]
    beacons: Option<String>,

    /// Track private / loopback addresses (useful for local test networks)
    #[arg(long)]
    allow_private_ips: bool,
}

fn parse_addr_list(list: Option<&str>) -> Vec<SocketAddr> {
    list.map(|s| {
        s.split(',')
            .filter_map(|part| part.trim().parse::<SocketAddr>().ok())
            .collect()
    })
    .unwrap_or_default()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("glacier=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let version = match AppVersion::parse(&format!("glacier/{}", VERSION)) {
        Ok(v) => v,
        Err(e) => {
            error!("bad build version: {}", e);
            return;
        }
    };

    let seeds = parse_addr_list(args.seeds.as_deref());
    let beacon_addrs = parse_addr_list(args.beacons.as_deref());

    let external_ip = args
        .external_ip
        .map(|ip| IpPort::new(ip, args.port))
        .unwrap_or_else(IpPort::zero);

    let mut config = NetConfig {
        network_id: args.network_id,
        ip: external_ip,
        version,
        allow_private_ips: args.allow_private_ips,
        ..NetConfig::default()
    };
    for addr in &beacon_addrs {
        let ip = IpPort::from_socket_addr(*addr);
        config.beacons.insert(NodeId::from_addr(&ip.to_string()));
    }

    info!("glacier v{} | network {} | port {}", VERSION, args.network_id, args.port);
    if !seeds.is_empty() {
        info!("seeds: {:?}", seeds);
    }

    let network = Network::new(config, Arc::new(NoopRouter));

    if let Err(e) = network.start(args.port).await {
        error!("failed to start network: {}", e);
        return;
    }

    for seed in seeds {
        network.track_ip(IpPort::from_socket_addr(seed)).await;
    }

    // Status printer
    let net = network.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            ticker.tick().await;
            info!(
                "status: {} peers | {} bytes pending",
                net.peer_count().await,
                net.pending_send_bytes()
            );
        }
    });

    info!("glacier running; waiting for peer connections");
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    network.shutdown().await;
}
