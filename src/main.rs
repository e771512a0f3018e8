//! vethernet client CLI.

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vethernet::platform::{PlatformRouting, RecordingRouting};
use vethernet::tap::MemoryTap;
use vethernet::transmission::ChannelConnector;
use vethernet::{Client, ClientConfig, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(name = "vethernet")]
#[command(about = "Client-side virtual-ethernet tunnel engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Virtual interface address
    #[arg(long, default_value = "10.8.0.2")]
    tap_ip: Ipv4Addr,

    /// Virtual gateway address
    #[arg(long, default_value = "10.8.0.1")]
    tap_gateway: Ipv4Addr,

    /// Virtual subnet mask
    #[arg(long, default_value = "255.255.255.0")]
    tap_netmask: Ipv4Addr,

    /// Physical default gateway used for bypass routes
    #[arg(long, default_value = "192.168.1.1")]
    physical_gateway: Ipv4Addr,

    /// Record route/DNS mutations instead of touching the OS
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();

    if let Err(e) = run(&cli).await {
        error!("Session error: {e:#}");
        return Err(e);
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    info!("Loading configuration from: {}", cli.config);
    let config = ClientConfig::load_json(&cli.config)
        .with_context(|| format!("Failed to load configuration from: {}", cli.config))?;

    // The TAP driver itself is a collaborator this binary does not
    // create; the in-memory device carries the addressing the engine
    // needs and records what it would have written.
    let tap = Arc::new(
        MemoryTap::new(cli.tap_ip, cli.tap_gateway, cli.tap_netmask)
            .with_dns(vec![cli.tap_gateway]),
    );
    let routing: Arc<dyn PlatformRouting> = if cli.dry_run {
        info!("Dry run: route and DNS changes are recorded only");
        Arc::new(RecordingRouting::new())
    } else {
        system_routing(&config.preferred_nic)
    };
    let connector = ChannelConnector::new();

    let mut client = Client::new(config, tap, routing, connector, cli.physical_gateway);
    client.open().await?;
    info!(state = %client.state(), "Engine running, press Ctrl-C to stop");
    client.run_until_interrupted().await?;
    info!("Session ended");
    Ok(())
}

#[cfg(target_os = "linux")]
fn system_routing(preferred_nic: &str) -> Arc<dyn PlatformRouting> {
    Arc::new(vethernet::platform::SystemRouting::new().with_device(preferred_nic))
}

#[cfg(not(target_os = "linux"))]
fn system_routing(_preferred_nic: &str) -> Arc<dyn PlatformRouting> {
    info!("No system routing backend for this platform, recording only");
    Arc::new(RecordingRouting::new())
}
