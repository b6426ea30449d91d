//! Statically configured backup jobs.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sentinel_common::{Error, Result};

use crate::borg::BorgClient;
use crate::config::{BackupConfig, RuntimeOptions};
use crate::exec::{archive_name, exec, exec_with_output};
use crate::schedule::Job;

use super::container_job::log_backup_complete;

/// Scheduled job for one `[[Backups]]` entry.
pub struct StaticBackupJob {
    cancel: CancellationToken,
    borg: Arc<BorgClient>,
    options: RuntimeOptions,
    backup: BackupConfig,
}

impl StaticBackupJob {
    pub fn new(
        cancel: CancellationToken,
        borg: Arc<BorgClient>,
        options: RuntimeOptions,
        backup: BackupConfig,
    ) -> Self {
        Self {
            cancel,
            borg,
            options,
            backup,
        }
    }

    async fn run_body(&self) -> Result<()> {
        if self.backup.exec.is_some() {
            self.run_exec_backup().await
        } else {
            self.run_paths_backup().await
        }
    }

    async fn run_exec_backup(&self) -> Result<()> {
        debug!(backup = %self.backup.name, "backing up exec result");

        let exec_config = self.backup.exec.as_ref().expect("exec body");
        if exec_config.command.is_empty() {
            return Err(Error::Config("no exec command specified".to_string()));
        }

        if exec_config.stdout.unwrap_or(false) {
            let stream = exec_with_output(self.cancel.clone(), &exec_config.command).await?;

            let stats = self
                .borg
                .create_with_input(
                    &self.cancel,
                    &archive_name(&self.backup.name),
                    Box::pin(stream.output),
                )
                .await
                .map_err(Error::from)?;

            // The archive keeps whatever bytes the tool read; the producer
            // failing afterwards only makes it possibly incomplete.
            if let Err(e) = stream.exit.wait().await {
                warn!(error = %e, "exec command failed, backup may be incomplete");
            }

            log_backup_complete(&self.backup.name, &stats, self.options.verbose);
            Ok(())
        } else {
            if exec_config.paths.is_empty() {
                return Err(Error::Config("no paths configured".to_string()));
            }

            exec(&self.cancel, &exec_config.command).await?;
            self.backup_paths(&exec_config.paths).await
        }
    }

    async fn run_paths_backup(&self) -> Result<()> {
        debug!(backup = %self.backup.name, "backing up static paths");

        let Some(paths) = &self.backup.paths else {
            return Err(Error::Config("no paths configured".to_string()));
        };

        self.backup_paths(&paths.paths).await
    }

    async fn backup_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Err(Error::Config("no paths specified".to_string()));
        }

        let stats = self
            .borg
            .create_with_paths(&self.cancel, &archive_name(&self.backup.name), paths)
            .await
            .map_err(Error::from)?;

        log_backup_complete(&self.backup.name, &stats, self.options.verbose);
        Ok(())
    }
}

#[async_trait]
impl Job for StaticBackupJob {
    async fn run(&self) {
        info!(backup = %self.backup.name, "starting static backup");

        let mut result = Ok(());
        if !self.backup.pre_command.is_empty() {
            result = exec(&self.cancel, &self.backup.pre_command).await;
        }

        if result.is_ok() {
            result = self.run_body().await;
        }

        if let Err(e) = &result {
            warn!(backup = %self.backup.name, error = %e, "backup failed");
        } else if !self.backup.post_command.is_empty() {
            let _ = exec(&self.cancel, &self.backup.post_command).await;
        }

        if !self.backup.finally_command.is_empty() {
            let _ = exec(&self.cancel, &self.backup.finally_command).await;
        }
    }
}
