//! Label-driven discovery of backup projects from engine snapshots.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use cron::Schedule;
use regex::Regex;
use tracing::warn;

use sentinel_common::{Error, Result};

use crate::config::parse_standard;
use crate::exec::split_command_line;

use super::{
    BackupMode, BackupProject, ContainerBackup, ExecBackup, Mount, LABEL_BACKUP_MODE,
    LABEL_DEPENDENCIES_PREFIX, LABEL_ENABLED, LABEL_EXEC, LABEL_EXEC_PATHS_PREFIX,
    LABEL_EXEC_STDOUT, LABEL_PROJECT_NAME, LABEL_PROJECT_WHEN, LABEL_SERVICE_NAME,
    LABEL_VOLUMES_PREFIX,
};

/// Engine-neutral view of one inspected container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSnapshot {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    /// Container environment, used for `&{NAME}` expansion at exec time.
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    /// Overlay upper directory, when the graph driver exposes one.
    pub upper_dir: Option<String>,
}

/// Whether the container opted into backups.
pub fn is_enabled(snapshot: &ContainerSnapshot) -> bool {
    snapshot
        .labels
        .get(LABEL_ENABLED)
        .map(|value| value == "true")
        .unwrap_or(false)
}

/// Project name and schedule from a member container's labels.
pub fn project_header(snapshot: &ContainerSnapshot) -> Result<(String, Schedule)> {
    let project_name = snapshot
        .labels
        .get(LABEL_PROJECT_NAME)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            Error::Config(format!("project name not found in container {}", snapshot.id))
        })?;

    let raw_schedule = snapshot.labels.get(LABEL_PROJECT_WHEN).ok_or_else(|| {
        Error::Config(format!(
            "project schedule not found in container {}",
            snapshot.id
        ))
    })?;

    let schedule = parse_standard(raw_schedule).map_err(|e| {
        Error::Config(format!(
            "failed to parse project schedule in container {}: {e}",
            snapshot.id
        ))
    })?;

    Ok((project_name.clone(), schedule))
}

/// Map one container's labels into its backup declaration.
///
/// Enforces the label invariants: a service name is required, exec needs
/// stdout xor paths, exec and backup volumes are mutually exclusive, and
/// offline mode forbids exec.
pub fn container_backup(snapshot: &ContainerSnapshot) -> Result<ContainerBackup> {
    let mut result = ContainerBackup {
        id: snapshot.id.clone(),
        service_name: String::new(),
        mode: BackupMode::Default,
        upper_dir: snapshot.upper_dir.clone(),
        exec: None,
        backup_volumes: Vec::new(),
        all_mounts: snapshot.mounts.clone(),
        dependencies: Vec::new(),
    };

    let mut exec = ExecBackup {
        command: Vec::new(),
        stdout: false,
        paths: Vec::new(),
    };

    for (key, value) in &snapshot.labels {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        if key == LABEL_BACKUP_MODE {
            result.mode = value.parse()?;
        } else if key.starts_with(LABEL_DEPENDENCIES_PREFIX) {
            result.dependencies.push(value.to_string());
        } else if key == LABEL_EXEC {
            exec.command = split_command_line(value);
        } else if key == LABEL_EXEC_STDOUT {
            exec.stdout = true;
        } else if key.starts_with(LABEL_EXEC_PATHS_PREFIX) {
            exec.paths.push(value.to_string());
        } else if key == LABEL_SERVICE_NAME {
            result.service_name = value.to_string();
        } else if key.starts_with(LABEL_VOLUMES_PREFIX) {
            let mount = snapshot
                .mounts
                .iter()
                .find(|mount| mount.destination == value)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "volume for destination {value} not found in {}",
                        result.id
                    ))
                })?;

            result.backup_volumes.push(mount.clone());
        }
    }

    if !exec.command.is_empty() {
        if exec.paths.is_empty() && !exec.stdout {
            return Err(Error::Config(format!(
                "exec must have either paths or stdout: {}",
                result.id
            )));
        }
        if !exec.paths.is_empty() && exec.stdout {
            return Err(Error::Config(format!(
                "exec must not have both paths and stdout: {}",
                result.id
            )));
        }

        result.exec = Some(exec);
    }

    if result.exec.is_some() && !result.backup_volumes.is_empty() {
        return Err(Error::Config(format!(
            "container must not have both exec and volumes: {}",
            result.id
        )));
    }

    if result.service_name.is_empty() {
        return Err(Error::Config(format!(
            "container must have a service name: {}",
            result.id
        )));
    }

    if result.mode == BackupMode::Offline && result.exec.is_some() {
        return Err(Error::Config(format!(
            "container cannot have exec with offline backup mode: {}",
            result.id
        )));
    }

    Ok(result)
}

/// Group enabled snapshots into projects, skipping (and logging) rejects.
pub fn collect_projects(engine_tag: &str, snapshots: &[ContainerSnapshot]) -> Vec<BackupProject> {
    let mut projects: BTreeMap<String, BackupProject> = BTreeMap::new();

    for snapshot in snapshots {
        if !is_enabled(snapshot) {
            continue;
        }

        let (project_name, schedule) = match project_header(snapshot) {
            Ok(header) => header,
            Err(e) => {
                warn!(container = %snapshot.id, error = %e, "failed to find or create project");
                continue;
            }
        };

        let backup = match container_backup(snapshot) {
            Ok(backup) => backup,
            Err(e) => {
                warn!(container = %snapshot.id, error = %e, "failed to map container backup");
                continue;
            }
        };

        let project = projects
            .entry(project_name.clone())
            .or_insert_with(|| BackupProject {
                engine: engine_tag.to_string(),
                project_name,
                schedule,
                containers: BTreeMap::new(),
            });

        project.containers.insert(backup.service_name.clone(), backup);
    }

    projects.into_values().collect()
}

fn env_reference_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"&\{([A-Za-z0-9_]+)\}|&([A-Za-z0-9_]+)").expect("valid regex")
    })
}

/// Expand `&{NAME}` and `&NAME` references against a container environment.
///
/// Unknown names are left verbatim.
pub fn expand_command(command: &[String], env: &BTreeMap<String, String>) -> Vec<String> {
    command
        .iter()
        .map(|argument| {
            env_reference_regex()
                .replace_all(argument, |captures: &regex::Captures<'_>| {
                    let name = captures
                        .get(1)
                        .or_else(|| captures.get(2))
                        .expect("one alternative matches")
                        .as_str();

                    match env.get(name) {
                        Some(value) => value.clone(),
                        None => captures
                            .get(0)
                            .expect("whole match")
                            .as_str()
                            .to_string(),
                    }
                })
                .into_owned()
        })
        .collect()
}
