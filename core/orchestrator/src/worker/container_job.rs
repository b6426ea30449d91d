//! Per-project container backup: plan building and execution.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sentinel_common::{Error, Result};

use crate::borg::{BorgClient, CreateOutput};
use crate::config::RuntimeOptions;
use crate::engine::{BackupMode, BackupProject, ContainerBackup, ContainerEngine};
use crate::exec::archive_name;
use crate::schedule::Job;

/// Resolve an in-container path to its host-side source.
///
/// Mount destinations are matched as case-insensitive prefixes; failing
/// that, a known overlay upper directory that prefixes the path wins.
pub fn resolve_in_container_path(container: &ContainerBackup, path: &str) -> Option<String> {
    let lower_path = path.to_lowercase();

    for mount in &container.all_mounts {
        let destination = mount.destination.to_lowercase();
        if lower_path.starts_with(&destination) {
            if let Some(rest) = path.get(mount.destination.len()..) {
                return Some(join_paths(&mount.source, rest));
            }
        }
    }

    if let Some(upper_dir) = &container.upper_dir {
        if !upper_dir.is_empty() && lower_path.starts_with(&upper_dir.to_lowercase()) {
            return Some(join_paths(upper_dir, path));
        }
    }

    None
}

fn join_paths(base: &str, rest: &str) -> String {
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        base.to_string()
    } else {
        format!("{}/{rest}", base.trim_end_matches('/'))
    }
}

fn detect_dependency_cycle(project: &BackupProject) -> Result<()> {
    fn visit(
        project: &BackupProject,
        service: &str,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
    ) -> Result<()> {
        if done.contains(service) {
            return Ok(());
        }
        if path.iter().any(|seen| seen == service) {
            return Err(Error::Config(format!(
                "dependency cycle involving service {service}"
            )));
        }

        path.push(service.to_string());
        if let Some(container) = project.containers.get(service) {
            for dependency in &container.dependencies {
                visit(project, dependency, path, done)?;
            }
        }
        path.pop();
        done.insert(service.to_string());

        Ok(())
    }

    let mut done = HashSet::new();
    for service in project.containers.keys() {
        visit(project, service, &mut Vec::new(), &mut done)?;
    }

    Ok(())
}

/// Build the execution plan for a project.
///
/// Validates exec path resolution, dependency references and acyclicity,
/// then orders the containers: a container precedes everything it depends
/// on; unrelated pairs order by mode rank (default, dependent-offline,
/// offline). This is the comparator rule, not a full topological sort.
pub fn build_plan(project: &BackupProject) -> Result<Vec<ContainerBackup>> {
    if project.containers.is_empty() {
        return Err(Error::Config("nothing to do".to_string()));
    }

    for container in project.containers.values() {
        if let Some(exec) = &container.exec {
            if !exec.stdout {
                for path in &exec.paths {
                    if resolve_in_container_path(container, path).is_none() {
                        return Err(Error::Config(format!(
                            "no source for in-container path {path}"
                        )));
                    }
                }
            }
        }

        for dependency in &container.dependencies {
            if !project.containers.contains_key(dependency) {
                return Err(Error::Config(format!(
                    "dependency {dependency} of {} not found",
                    container.service_name
                )));
            }
        }
    }

    detect_dependency_cycle(project)?;

    let mut plan: Vec<ContainerBackup> = project.containers.values().cloned().collect();
    plan.sort_by(|a, b| {
        if a.dependencies.contains(&b.service_name) {
            Ordering::Less
        } else if b.dependencies.contains(&a.service_name) {
            Ordering::Greater
        } else {
            a.mode.cmp(&b.mode)
        }
    });

    Ok(plan)
}

/// Scheduled job backing up one container project.
pub struct ContainerProjectJob {
    cancel: CancellationToken,
    engine: Arc<dyn ContainerEngine>,
    borg: Arc<BorgClient>,
    options: RuntimeOptions,
    project: BackupProject,
    plan: Vec<ContainerBackup>,
}

impl ContainerProjectJob {
    /// Validate the project and build its plan.
    pub fn new(
        cancel: CancellationToken,
        engine: Arc<dyn ContainerEngine>,
        borg: Arc<BorgClient>,
        options: RuntimeOptions,
        project: BackupProject,
    ) -> Result<Self> {
        let plan = build_plan(&project)?;

        Ok(Self {
            cancel,
            engine,
            borg,
            options,
            project,
            plan,
        })
    }

    fn log_context(&self, container: &ContainerBackup) -> String {
        format!(
            "{}/{}/{}",
            self.project.project_name, container.service_name, container.id
        )
    }

    async fn run_online(&self, container: &ContainerBackup, backup_name: &str) {
        info!(container = %self.log_context(container), "starting online backup");

        if let Err(e) = self.engine.ensure_running(&self.cancel, &container.id).await {
            warn!(
                container = %self.log_context(container),
                error = %e,
                "failed to ensure container running for online backup"
            );
            return;
        }

        if container.exec.is_some() {
            self.run_exec_backup(container, backup_name).await;
        } else {
            self.run_volume_backup(container, backup_name).await;
        }
    }

    async fn run_dependent_offline(&self, container: &ContainerBackup, backup_name: &str) {
        info!(
            container = %self.log_context(container),
            "starting online backup (dependents offline)"
        );

        if let Err(e) = self.engine.ensure_running(&self.cancel, &container.id).await {
            warn!(
                container = %self.log_context(container),
                error = %e,
                "failed to ensure container running for online backup (dependents offline)"
            );
            return;
        }

        let dependents = self.find_dependents(container);
        if !dependents.is_empty() {
            let stops = dependents.iter().map(|dependent| {
                let engine = self.engine.clone();
                let cancel = self.cancel.clone();
                let id = dependent.id.clone();
                async move { engine.ensure_stopped(&cancel, &id).await }
            });

            let results = join_all(stops).await;
            if let Some(e) = results.into_iter().find_map(|r| r.err()) {
                warn!(
                    container = %self.log_context(container),
                    error = %e,
                    "failed to ensure dependent containers stopped"
                );
                return;
            }
        }

        if container.exec.is_some() {
            self.run_exec_backup(container, backup_name).await;
        } else {
            self.run_volume_backup(container, backup_name).await;
        }
    }

    async fn run_offline(&self, container: &ContainerBackup, backup_name: &str) {
        info!(container = %self.log_context(container), "starting offline backup");

        if let Err(e) = self.engine.ensure_stopped(&self.cancel, &container.id).await {
            warn!(
                container = %self.log_context(container),
                error = %e,
                "failed to ensure container stopped for offline backup"
            );
            return;
        }

        self.run_volume_backup(container, backup_name).await;
    }

    async fn run_exec_backup(&self, container: &ContainerBackup, backup_name: &str) {
        debug!(container = %self.log_context(container), "backing up exec result");

        let exec = container.exec.as_ref().expect("exec backup requires exec");

        if exec.stdout {
            let stream = match self
                .engine
                .exec_with_output(&self.cancel, &container.id, &exec.command)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        container = %self.log_context(container),
                        error = %e,
                        "failed to execute exec command"
                    );
                    return;
                }
            };

            let result = self
                .borg
                .create_with_input(
                    &self.cancel,
                    &archive_name(backup_name),
                    Box::pin(stream.output),
                )
                .await;

            let stats = match result {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(
                        container = %self.log_context(container),
                        error = %e,
                        "backup failed"
                    );
                    return;
                }
            };

            // The archive stands on the bytes the tool read; a failed
            // producer only downgrades it to possibly incomplete.
            if let Err(e) = stream.exit.wait().await {
                warn!(
                    container = %self.log_context(container),
                    error = %e,
                    "exec command failed, backup may be incomplete"
                );
            }

            log_backup_complete(backup_name, &stats, self.options.verbose);
        } else {
            if let Err(e) = self
                .engine
                .exec(&self.cancel, &container.id, &exec.command)
                .await
            {
                warn!(
                    container = %self.log_context(container),
                    error = %e,
                    "failed to execute exec command"
                );
                return;
            }

            let mut paths = Vec::with_capacity(exec.paths.len());
            for path in &exec.paths {
                match resolve_in_container_path(container, path) {
                    Some(source) => paths.push(source),
                    None => {
                        warn!(
                            container = %self.log_context(container),
                            path = %path, "no source for path"
                        );
                    }
                }
            }

            match self
                .borg
                .create_with_paths(&self.cancel, &archive_name(backup_name), &paths)
                .await
            {
                Ok(stats) => log_backup_complete(backup_name, &stats, self.options.verbose),
                Err(e) => {
                    warn!(
                        container = %self.log_context(container),
                        error = %e,
                        "backup failed"
                    );
                }
            }
        }
    }

    async fn run_volume_backup(&self, container: &ContainerBackup, backup_name: &str) {
        let paths: Vec<String> = container
            .backup_volumes
            .iter()
            .map(|volume| volume.source.clone())
            .collect();

        match self
            .borg
            .create_with_paths(&self.cancel, &archive_name(backup_name), &paths)
            .await
        {
            Ok(stats) => log_backup_complete(backup_name, &stats, self.options.verbose),
            Err(e) => {
                warn!(
                    container = %self.log_context(container),
                    error = %e,
                    "backup failed"
                );
            }
        }
    }

    fn find_dependents(&self, container: &ContainerBackup) -> Vec<&ContainerBackup> {
        self.project
            .containers
            .values()
            .filter(|candidate| {
                candidate
                    .dependencies
                    .contains(&container.service_name)
            })
            .collect()
    }
}

#[async_trait]
impl Job for ContainerProjectJob {
    async fn run(&self) {
        for container in &self.plan {
            if !container.needs_backup() {
                debug!(
                    container = %self.log_context(container),
                    "skipping container, backup not needed"
                );
                continue;
            }

            let backup_name = format!(
                "{}-{}",
                self.project.project_name, container.service_name
            );

            match container.mode {
                BackupMode::Default => self.run_online(container, &backup_name).await,
                BackupMode::DependentOffline => {
                    self.run_dependent_offline(container, &backup_name).await
                }
                BackupMode::Offline => self.run_offline(container, &backup_name).await,
            }
        }

        // Whatever happened above, bring the whole project back up.
        let restarts = self.project.containers.values().map(|container| {
            let engine = self.engine.clone();
            let cancel = self.cancel.clone();
            let id = container.id.clone();
            let context = self.log_context(container);
            async move {
                if let Err(e) = engine.ensure_running(&cancel, &id).await {
                    warn!(
                        container = %context,
                        error = %e,
                        "failed to ensure container running after backup"
                    );
                }
            }
        });

        join_all(restarts).await;
    }
}

pub(crate) fn log_backup_complete(backup_name: &str, stats: &CreateOutput, verbose: bool) {
    if verbose {
        if let Some(archive) = &stats.archive {
            info!(
                backup = backup_name,
                archive = %archive.name,
                nfiles = archive.stats.as_ref().map(|s| s.nfiles),
                deduplicated_size = archive.stats.as_ref().map(|s| s.deduplicated_size),
                "backup complete"
            );
            return;
        }
    }

    info!(backup = backup_name, "backup complete");
}
