//! Orchestrator configuration: TOML model, validation, reload watching.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use cron::Schedule;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sentinel_common::{Error, Result};

/// Process-wide runtime flags, threaded through constructors.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// Configure everything without running any backup.
    pub dry_run: bool,
    /// Run all configured backups once and exit.
    pub once: bool,
    /// Verbose log output, including job payloads.
    pub verbose: bool,
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    pub repo: RepositoryConfig,
    pub encryption: Option<EncryptionConfig>,
    #[serde(default)]
    pub backups: Vec<BackupConfig>,
}

/// Archive repository settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RepositoryConfig {
    pub location: String,
    pub identity_file: Option<String>,
    compaction_schedule: Option<String>,
    #[serde(skip)]
    compaction_parsed: Option<Schedule>,
}

impl RepositoryConfig {
    /// Parsed compaction schedule, if configured.
    pub fn compaction_schedule(&self) -> Option<&Schedule> {
        self.compaction_parsed.as_ref()
    }
}

/// Repository encryption settings; exactly one source must be set.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionConfig {
    pub secret: Option<String>,
    pub secret_command: Option<String>,
}

/// One statically configured backup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupConfig {
    pub name: String,
    schedule: String,
    #[serde(skip)]
    schedule_parsed: Option<Schedule>,
    pub exec: Option<ExecBackupConfig>,
    pub paths: Option<PathsBackupConfig>,
    #[serde(default)]
    pub pre_command: Vec<String>,
    #[serde(default)]
    pub post_command: Vec<String>,
    #[serde(default)]
    pub finally_command: Vec<String>,
}

impl BackupConfig {
    /// Parsed schedule; present after a successful [`load_config`].
    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule_parsed.as_ref()
    }
}

/// Exec-style backup body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecBackupConfig {
    pub command: Vec<String>,
    pub stdout: Option<bool>,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Paths-style backup body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PathsBackupConfig {
    pub paths: Vec<String>,
}

/// Parse a standard 5-field cron expression.
///
/// The underlying parser wants a seconds field; standard expressions get one
/// prepended.
pub fn parse_standard(expression: &str) -> Result<Schedule> {
    let fields = expression.split_whitespace().count();
    let full = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };

    Schedule::from_str(&full)
        .map_err(|e| Error::Config(format!("invalid schedule {expression}: {e}")))
}

/// Load and validate the configuration file.
pub fn load_config(path: &std::path::Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)?;

    let mut config: Config =
        toml::from_str(&raw).map_err(|e| Error::Config(format!("toml: {e}")))?;

    if let Some(raw_schedule) = &config.repo.compaction_schedule {
        let schedule = parse_standard(raw_schedule)
            .map_err(|e| Error::Config(format!("invalid compaction schedule: {e}")))?;
        config.repo.compaction_parsed = Some(schedule);
    }

    if let Some(encryption) = &config.encryption {
        if encryption.secret.is_some() == encryption.secret_command.is_some() {
            return Err(Error::Config(
                "encryption config must specify either Secret or SecretCommand".to_string(),
            ));
        }
    }

    for backup in &mut config.backups {
        let schedule = parse_standard(&backup.schedule).map_err(|e| {
            Error::Config(format!("invalid backup schedule for {}: {e}", backup.name))
        })?;
        backup.schedule_parsed = Some(schedule);
    }

    Ok(config)
}

/// Channels produced by [`watch_config`].
pub struct ConfigWatch {
    /// Successfully reloaded snapshots.
    pub updates: mpsc::Receiver<Config>,
    /// Terminal watch failures.
    pub errors: mpsc::Receiver<Error>,
}

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watch the config file for modification.
///
/// Reload failures are logged and skipped; the file disappearing is a
/// terminal error delivered on the error channel.
pub fn watch_config(path: PathBuf, cancel: CancellationToken) -> ConfigWatch {
    let (update_tx, updates) = mpsc::channel(1);
    let (error_tx, errors) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut last_modified: Option<SystemTime> = None;

        info!(path = %path.display(), "watching config file for changes");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return,
            }

            let modified = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata.modified().ok(),
                Err(e) => {
                    let _ = error_tx
                        .send(Error::Config(format!(
                            "config file vanished: {}: {e}",
                            path.display()
                        )))
                        .await;
                    return;
                }
            };

            let changed = match (last_modified, modified) {
                (Some(previous), Some(current)) => current > previous,
                (None, Some(_)) => {
                    // First observation establishes the baseline.
                    last_modified = modified;
                    continue;
                }
                _ => false,
            };

            if !changed {
                continue;
            }

            last_modified = modified;
            info!("config file changed");

            match load_config(&path) {
                Ok(config) => {
                    if update_tx.send(config).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load config file");
                }
            }
        }
    });

    ConfigWatch { updates, errors }
}
