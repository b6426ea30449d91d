//! credstore - securely stores and provides credentials over the network.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sentinel_storage::LocalBackend;
use sentinel_vault::{load_store_config, Vault, VaultOptions, VaultService};

#[derive(Parser)]
#[command(name = "credstore")]
#[command(about = "Securely stores and provides credentials over the network")]
#[command(version)]
struct Cli {
    /// Path to the configuration file.
    config_path: PathBuf,

    /// Run in production mode (requires TLS config).
    #[arg(short, long)]
    production: bool,

    /// Accept an unverified recovery recipient left behind by a pre-0.2.0
    /// vault on the next unlock.
    #[arg(long)]
    confirm_recovery_upgrade: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_store_config(&cli.config_path)
        .with_context(|| format!("loading {}", cli.config_path.display()))?;
    config.validate(cli.production)?;

    let backend = Arc::new(LocalBackend::new(&config.storage_path));
    let vault = Arc::new(
        Vault::new(
            backend,
            VaultOptions {
                secure: cli.production,
                confirm_recovery_upgrade: cli.confirm_recovery_upgrade,
            },
        )
        .await?,
    );

    let _service = VaultService::new(vault);

    if cli.production {
        info!("running in production mode");
    }

    info!(address = %config.listen_address, "listening");
    if let Some(metrics_address) = &config.metrics_listen_address {
        info!(address = %metrics_address, "metrics available");
    }

    // The RPC transport hosts the service; it owns the listener and drives
    // the handlers until shutdown.
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    Ok(())
}
