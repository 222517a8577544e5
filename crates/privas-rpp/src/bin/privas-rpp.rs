use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use privas_rpp::{
    Registry, Timing,
    config::RppConfig,
    server::Server,
    tps::CommandTps,
};
use tokio::net::TcpListener;

/// The Reference Panel Provider of privas association-test sessions.
#[derive(Debug, Parser)]
#[command(name = "privas-rpp")]
pub struct Cli {
    /// The RPP configuration file.
    #[arg(long, short)]
    pub config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = RppConfig::load(&cli.config)
        .with_context(|| format!("invalid configuration {}", cli.config.display()))?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let tps = CommandTps::new(config.tps.clone());
    let registry = Registry::open(config, tps, Timing::default())
        .await
        .context("unable to open the session directory")?;
    let _sweep = registry.spawn_expiry_sweep();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to listen on {addr}"))?;
    Server::new(registry).serve(listener).await?;
    Ok(())
}
