//! athergate-daemon: wires the Athernet LAN tunnel and the WAN NIC into a
//! running NAT gateway.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use athergate_net::datapath::DEFAULT_RING_CAPACITY;
use athergate_net::device::{athernet, raw_socket};
use athergate_net::NatServer;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "athergate-daemon")]
#[command(author, version, about, long_about = None)]
struct DaemonArgs {
    /// Unix socket path of the Athernet tunnel peer.
    #[arg(long, default_value = "/tmp/athernet.sock")]
    tunnel: PathBuf,

    /// Gateway WAN IPv4 address. Discovered from the default capture
    /// device when omitted.
    #[arg(long)]
    gateway_ip: Option<Ipv4Addr>,

    /// Per-device ring capacity in slots.
    #[arg(long, default_value_t = DEFAULT_RING_CAPACITY)]
    ring_capacity: usize,

    /// Static port mapping `<lan_ip>:<lan_port>`. Repeatable; mappings
    /// reserve consecutive WAN ports starting at 50000, in order.
    #[arg(long = "map", value_parser = parse_endpoint)]
    maps: Vec<(Ipv4Addr, u16)>,
}

/// Parses an `a.b.c.d:port` endpoint.
fn parse_endpoint(s: &str) -> Result<(Ipv4Addr, u16), String> {
    let (ip, port) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <lan_ip>:<lan_port>, got `{s}`"))?;
    let ip = ip
        .parse::<Ipv4Addr>()
        .map_err(|err| format!("invalid IPv4 address `{ip}`: {err}"))?;
    let port = port
        .parse::<u16>()
        .map_err(|err| format!("invalid port `{port}`: {err}"))?;
    Ok((ip, port))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "athergate_net=info,athergate_daemon=info".into()),
        )
        // Stdout is reserved for the port-mapping announcements; all
        // diagnostics go to stderr.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    run(DaemonArgs::parse())
}

fn run(args: DaemonArgs) -> Result<()> {
    let gateway_ip = match args.gateway_ip {
        Some(ip) => ip,
        None => raw_socket::lookup_local_ip().context("discovering the gateway IP")?,
    };
    info!(%gateway_ip, tunnel = %args.tunnel.display(), "starting athergate");

    let lan = athernet::connect(&args.tunnel, args.ring_capacity)
        .context("opening the Athernet tunnel device")?;
    let wan =
        raw_socket::open(gateway_ip, args.ring_capacity).context("opening the WAN NIC device")?;

    NatServer::start(lan, wan, gateway_ip, &args.maps).join();
    Ok(())
}
