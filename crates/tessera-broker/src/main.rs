//! Standalone Tessera broker.
//!
//! ```bash
//! tessera-broker --config /etc/tessera/broker.toml
//! TESSERA_BROKER_NAME=broker-b tessera-broker --config broker.toml
//! RUST_LOG=tessera_core=debug tessera-broker --config broker.toml
//! ```

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tessera_broker::{Broker, BrokerConfig, LoggingDispatch};
use tessera_net::{SystemEnv, default_registry};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Tessera message broker node
#[derive(Parser, Debug)]
#[command(name = "tessera-broker", version, about)]
struct Args {
    /// Path to the broker TOML configuration
    #[arg(long, short)]
    config: PathBuf,

    /// Override the broker name from the configuration file
    #[arg(long, env = "TESSERA_BROKER_NAME")]
    name: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = BrokerConfig::load(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(name) = args.name {
        config.name = name;
    }

    let broker = Broker::start(config, SystemEnv::new(), default_registry(), Arc::new(LoggingDispatch))
        .await
        .context("starting broker")?;
    for uri in broker.connector_uris() {
        info!(%uri, "accepting clients");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    broker.shutdown().await;
    Ok(())
}
