//! borgd - schedules and controls the execution of borg backups.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sentinel_orchestrator::{
    config::{load_config, watch_config},
    BorgClient, ContainerEngine, RuntimeOptions, Scheduler, Worker,
};

#[derive(Parser)]
#[command(name = "borgd")]
#[command(about = "Schedules and controls the execution of borg backups")]
#[command(version)]
struct Cli {
    /// Path to the configuration file.
    config_path: PathBuf,

    /// Configure all backups without actually running them.
    #[arg(long)]
    dry_run: bool,

    /// Run all configured backups once and exit.
    #[arg(long)]
    once: bool,

    /// Enable verbose log output.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let options = RuntimeOptions {
        dry_run: cli.dry_run,
        once: cli.once,
        verbose: cli.verbose,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(if options.verbose { "debug" } else { "info" }))
        .init();

    let config = load_config(&cli.config_path)
        .with_context(|| format!("loading {}", cli.config_path.display()))?;

    let borg = Arc::new(
        BorgClient::connect(config.clone())
            .await
            .context("failed to create borg client")?,
    );

    // The engine API client is wired in by deployment; without one, only
    // static backups run.
    let engine: Option<Arc<dyn ContainerEngine>> = None;
    if engine.is_none() {
        warn!("container engine not available");
    }

    let cancel = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new());
    let worker = Worker::new(
        options,
        borg.clone(),
        engine.clone(),
        scheduler,
        cancel.clone(),
    );

    worker.schedule_static_backups(&config.backups);
    worker.schedule_repo_compaction(&config);

    if let Some(engine) = &engine {
        let projects = engine
            .list_projects()
            .await
            .context("failed to load container state")?;
        worker
            .schedule_container_backups(projects)
            .context("failed to schedule container backups")?;
    }

    if options.dry_run {
        info!("dry run, not executing any backups");
        return Ok(());
    }

    let info = borg
        .ensure_repository(&cancel)
        .await
        .context("failed to retrieve borg repository info")?;
    info!(repository = %info.repository.id, "retrieved borg repository info");

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            cancel.cancel();
        });
    }

    if options.once {
        worker.run_once().await?;
        return Ok(());
    }

    let config_watch = watch_config(cli.config_path.clone(), cancel.clone());
    let engine_watch = engine.as_ref().map(|engine| engine.watch(cancel.clone()));

    worker
        .run(config_watch, engine_watch)
        .await
        .context("scheduler failed")?;

    Ok(())
}
