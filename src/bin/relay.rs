use anyhow::{Context, Result};
use clap::Parser;
use sharp_relay::{init_logging, run_collector, Allocator, RelayConfig, VERSION};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about = "SHARP Relay Allocation Server", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IP relayed addresses are bound on
    #[arg(long)]
    relay_ip: Option<IpAddr>,

    /// Relay ports are scanned upward from just above this port
    #[arg(long)]
    base_port: Option<u16>,

    /// Highest relay port
    #[arg(long)]
    max_port: Option<u16>,

    /// Seconds between expiry sweeps
    #[arg(long)]
    collect_interval: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => RelayConfig::default(),
        };

        if let Some(ip) = self.relay_ip {
            config.relay_ip = ip;
        }
        if let Some(port) = self.base_port {
            config.base_port = port;
        }
        if let Some(port) = self.max_port {
            config.max_port = port;
        }
        if let Some(secs) = self.collect_interval {
            config.collect_interval_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = args.into_config()?;
    let allocator = Allocator::from_config(&config)?;

    tracing::info!("SHARP relay v{} starting, relay base {}", VERSION, config.base_addr());

    let shutdown = CancellationToken::new();
    let collector = tokio::spawn(run_collector(
        allocator.clone(),
        config.collect_interval(),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("Shutdown requested");

    shutdown.cancel();
    collector.await?;

    let stats = serde_json::to_string(&allocator.stats())?;
    tracing::info!("Final allocator stats: {}", stats);
    Ok(())
}
