//! Container-engine capability surface.
//!
//! The orchestrator is engine-neutral: it consumes this trait plus the label
//! conventions below. The engine API client itself (Docker or otherwise) is
//! an external collaborator wired in at construction time by its engine tag.

pub mod discovery;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sentinel_common::{Error, Result};

use crate::exec::ExecStream;

/// Label namespace driving discovery.
pub const LABEL_ENABLED: &str = "io.v47.borgd.enabled";
pub const LABEL_PROJECT_NAME: &str = "io.v47.borgd.project_name";
pub const LABEL_PROJECT_WHEN: &str = "io.v47.borgd.when";
pub const LABEL_SERVICE_NAME: &str = "io.v47.borgd.service_name";
pub const LABEL_BACKUP_MODE: &str = "io.v47.borgd.service.mode";
pub const LABEL_DEPENDENCIES_PREFIX: &str = "io.v47.borgd.service.dependencies.";
pub const LABEL_EXEC: &str = "io.v47.borgd.service.exec";
pub const LABEL_EXEC_STDOUT: &str = "io.v47.borgd.service.stdout";
pub const LABEL_EXEC_PATHS_PREFIX: &str = "io.v47.borgd.service.paths.";
pub const LABEL_VOLUMES_PREFIX: &str = "io.v47.borgd.service.volumes.";

/// How a container is treated during its project's backup.
///
/// The discriminant order is the plan tie-breaker: lower runs earlier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum BackupMode {
    /// Keep the container running.
    Default = 1,
    /// Keep the container running, stop its dependents.
    DependentOffline = 2,
    /// Stop the container itself; exec is illegal here.
    Offline = 3,
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BackupMode::Default => "default",
            BackupMode::DependentOffline => "dependent-offline",
            BackupMode::Offline => "offline",
        };
        write!(f, "{text}")
    }
}

impl FromStr for BackupMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(BackupMode::Default),
            "dependent-offline" => Ok(BackupMode::DependentOffline),
            "offline" => Ok(BackupMode::Offline),
            other => Err(Error::Config(format!("unrecognized backup mode: {other}"))),
        }
    }
}

/// A mount visible inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount kind (`bind` or `volume`).
    pub kind: String,
    /// Volume name, empty for binds.
    pub name: String,
    /// Host-side source path.
    pub source: String,
    /// In-container destination path.
    pub destination: String,
}

/// Exec parameters of a container backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecBackup {
    /// Argument vector; may contain `&{NAME}` environment references.
    pub command: Vec<String>,
    /// Pipe the command's stdout into the archive as a single stream.
    pub stdout: bool,
    /// In-container paths to archive after the command completes.
    /// Mutually exclusive with `stdout`.
    pub paths: Vec<String>,
}

/// One container's backup declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerBackup {
    pub id: String,
    pub service_name: String,
    pub mode: BackupMode,
    /// Overlay upper directory, when the graph driver exposes one.
    pub upper_dir: Option<String>,
    pub exec: Option<ExecBackup>,
    pub backup_volumes: Vec<Mount>,
    pub all_mounts: Vec<Mount>,
    /// Service names this container depends on.
    pub dependencies: Vec<String>,
}

impl ContainerBackup {
    /// Whether this container contributes anything to the backup.
    pub fn needs_backup(&self) -> bool {
        self.exec.is_some() || !self.backup_volumes.is_empty()
    }
}

/// A set of containers sharing a project label and a schedule.
#[derive(Debug, Clone)]
pub struct BackupProject {
    /// Engine tag this project was discovered from.
    pub engine: String,
    pub project_name: String,
    pub schedule: Schedule,
    /// Containers keyed by service name.
    pub containers: BTreeMap<String, ContainerBackup>,
}

/// Watch channels produced by an engine.
pub struct EngineWatch {
    /// Project snapshots; a snapshot replaces the project's job wholesale.
    pub updates: mpsc::Receiver<BackupProject>,
    /// Terminal watch failures.
    pub errors: mpsc::Receiver<Error>,
}

/// Capability set the orchestrator consumes from a container engine.
///
/// `ensure_running` must only report success once a health-checked container
/// is `healthy`; `unhealthy` or a timeout fails. `exec_with_output` demuxes
/// the engine's multiplexed stream into a single stdout reader.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine tag (e.g. `docker`).
    fn tag(&self) -> &str;

    /// Start the container if needed and wait for it to be healthy.
    async fn ensure_running(&self, cancel: &CancellationToken, container_id: &str) -> Result<()>;

    /// Stop the container if it is running.
    async fn ensure_stopped(&self, cancel: &CancellationToken, container_id: &str) -> Result<()>;

    /// Run a command inside the container to completion.
    async fn exec(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        command: &[String],
    ) -> Result<()>;

    /// Run a command inside the container, streaming its stdout.
    async fn exec_with_output(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        command: &[String],
    ) -> Result<ExecStream>;

    /// Snapshot of all enabled backup projects.
    async fn list_projects(&self) -> Result<Vec<BackupProject>>;

    /// Watch for project changes.
    fn watch(&self, cancel: CancellationToken) -> EngineWatch;
}
