//! The Sentinel backup orchestrator.
//!
//! A cron-driven scheduler maintaining two kinds of jobs: static
//! path-or-exec backups from the config file, and per-project container
//! backups discovered from a container engine by label. The archive engine
//! is the external `borg` binary, driven as a subprocess.
//!
//! # Architecture
//! - `config`: TOML model, validation and reload watching
//! - `schedule`: cron dispatch with skip-if-running and panic recovery
//! - `borg`: the archive-tool subprocess client
//! - `engine`: the engine-neutral container capability and label discovery
//! - `worker`: the main loop, plan building and the jobs themselves

pub mod borg;
pub mod config;
pub mod engine;
pub mod exec;
pub mod schedule;
pub mod worker;

pub use borg::{BorgClient, CreateOutput, InfoOutput};
pub use config::{Config, ConfigWatch, RuntimeOptions};
pub use engine::{BackupMode, BackupProject, ContainerBackup, ContainerEngine, EngineWatch};
pub use schedule::{Job, JobId, Scheduler};
pub use worker::Worker;
