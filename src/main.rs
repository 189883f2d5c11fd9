use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use netrender_master::config::{BalancerConfig, MasterConfig};
use netrender_master::node::MasterNode;
use netrender_master::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "netrender-master")]
#[command(version)]
#[command(about = "Network render farm master: dispatches frames to render slaves")]
struct Args {
    /// Address to bind the HTTP listener to
    #[arg(long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// Port to listen on
    #[arg(long, short = 'p', default_value = "8000")]
    port: u16,

    /// Directory holding the master_<pid> job storage
    #[arg(long, default_value_os_t = std::env::temp_dir())]
    path: PathBuf,

    /// Minutes without contact before a slave is dropped
    #[arg(long, default_value = "2")]
    slave_timeout: u64,

    /// Seconds between maintenance passes (timeouts, usage, broadcast)
    #[arg(long, default_value = "10")]
    interval: u64,

    /// Broadcast the listening port over UDP
    #[arg(long)]
    broadcast: bool,

    /// UDP port the broadcast is sent to
    #[arg(long, default_value = "8000")]
    broadcast_port: u16,

    /// Reload jobs saved by previous runs under --path
    #[arg(long)]
    recover: bool,

    // === Balancer ===
    /// Seconds after a dispatch before a job is prioritised again
    #[arg(long, default_value = "2")]
    min_dispatch_interval: u64,

    /// Maximum share of slaves one job may use while others are queued
    #[arg(long, default_value = "0.75")]
    slaves_limit: f64,

    /// Rate jobs by usage instead of by credits
    #[arg(long)]
    rate_by_usage: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = MasterConfig {
        listen_addr: SocketAddr::new(args.address, args.port),
        root_path: args.path,
        slave_timeout: Duration::from_secs(args.slave_timeout.saturating_mul(60)),
        maintenance_interval: Duration::from_secs(args.interval.max(1)),
        broadcast: args.broadcast,
        broadcast_port: args.broadcast_port,
        recover: args.recover,
        balancer: BalancerConfig {
            min_dispatch_interval: Duration::from_secs(args.min_dispatch_interval),
            slaves_limit: args.slaves_limit,
            rate_by_usage: args.rate_by_usage,
        },
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        root = %config.root_path.display(),
        slave_timeout_secs = config.slave_timeout.as_secs(),
        broadcast = config.broadcast,
        recover = config.recover,
        "Starting netrender master"
    );

    let shutdown = install_shutdown_handler();
    let node = MasterNode::new(config)?;
    node.run(shutdown).await?;

    Ok(())
}
