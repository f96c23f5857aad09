//! The `run` subcommand: start a conductor and serve until ctrl-c.
//!
//! Runs against the in-memory store with the built-in fake driver;
//! production deployments swap in a durable store backend and real
//! drivers behind the same interfaces.

use clap::Args;
use color_eyre::eyre::Result;
use roundhouse_conductor::{Conductor, ConductorConfig};
use roundhouse_engine::{default_fake_driver, DriverRegistry};
use roundhouse_store::{MemoryStore, Store};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args)]
pub struct RunArgs {
    /// Path to a TOML config file; defaults apply when absent
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the conductor hostname from the config
    #[arg(long)]
    pub hostname: Option<String>,

    /// Conductor group (partition) to serve
    #[arg(long)]
    pub group: Option<String>,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ConductorConfig::load(path)?,
        None => ConductorConfig::default(),
    };
    if let Some(hostname) = args.hostname {
        config.hostname = hostname;
    }
    if let Some(group) = args.group {
        config.group = Some(group);
    }

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mut registry = DriverRegistry::new();
    registry.register(default_fake_driver());

    let conductor = Arc::new(Conductor::new(config, store, Arc::new(registry)));
    conductor.start().await?;
    info!(conductor = %conductor.id(), "conductor running; press ctrl-c to stop");

    let mut events = conductor.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!(?event, "execution event");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    conductor.stop().await?;
    Ok(())
}
