//! The orchestrator main loop and job bookkeeping.

pub mod container_job;
pub mod static_job;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sentinel_common::{Error, Result};

use crate::borg::BorgClient;
use crate::config::{BackupConfig, Config, ConfigWatch, RuntimeOptions};
use crate::engine::{BackupProject, ContainerEngine, EngineWatch};
use crate::schedule::{Job, JobId, Scheduler};

use container_job::ContainerProjectJob;
use static_job::StaticBackupJob;

/// Job firing repository compaction.
struct CompactionJob {
    cancel: CancellationToken,
    borg: Arc<BorgClient>,
}

#[async_trait]
impl Job for CompactionJob {
    async fn run(&self) {
        if let Err(e) = self.borg.compact(&self.cancel).await {
            warn!(error = %e, "repository compaction failed");
        }
    }
}

#[derive(Default)]
struct JobBook {
    compaction: Option<JobId>,
    statics: Vec<JobId>,
    projects: HashMap<String, JobId>,
}

/// Drives the scheduler from config snapshots and engine project snapshots.
pub struct Worker {
    options: RuntimeOptions,
    borg: Arc<BorgClient>,
    engine: Option<Arc<dyn ContainerEngine>>,
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    // Serializes job replacement between the main loop and callers.
    jobs: Mutex<JobBook>,
}

impl Worker {
    pub fn new(
        options: RuntimeOptions,
        borg: Arc<BorgClient>,
        engine: Option<Arc<dyn ContainerEngine>>,
        scheduler: Arc<Scheduler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            borg,
            engine,
            scheduler,
            cancel,
            jobs: Mutex::new(JobBook::default()),
        }
    }

    /// Replace the compaction job from a config snapshot.
    pub fn schedule_repo_compaction(&self, config: &Config) {
        let mut jobs = self.jobs.lock().expect("job book lock");

        if let Some(id) = jobs.compaction.take() {
            self.scheduler.remove(id);
        }

        if let Some(schedule) = config.repo.compaction_schedule() {
            let job = Arc::new(CompactionJob {
                cancel: self.cancel.clone(),
                borg: self.borg.clone(),
            });

            jobs.compaction = Some(self.scheduler.schedule(
                schedule.clone(),
                "repo-compaction",
                job,
            ));
        }
    }

    /// Replace all static backup jobs from a config snapshot.
    pub fn schedule_static_backups(&self, backups: &[BackupConfig]) {
        let mut jobs = self.jobs.lock().expect("job book lock");

        for id in jobs.statics.drain(..) {
            self.scheduler.remove(id);
        }

        for backup in backups {
            let Some(schedule) = backup.schedule() else {
                warn!(backup = %backup.name, "backup has no parsed schedule, skipping");
                continue;
            };

            if self.options.verbose {
                info!(backup = %backup.name, config = ?backup, "scheduling static backup");
            } else {
                info!(backup = %backup.name, "scheduling static backup");
            }

            let job = Arc::new(StaticBackupJob::new(
                self.cancel.clone(),
                self.borg.clone(),
                self.options,
                backup.clone(),
            ));

            let id = self.scheduler.schedule(
                schedule.clone(),
                format!("static:{}", backup.name),
                job,
            );
            jobs.statics.push(id);
        }
    }

    /// Schedule the given projects; failures are returned for the caller.
    pub fn schedule_container_backups(&self, projects: Vec<BackupProject>) -> Result<()> {
        for project in projects {
            self.schedule_project(project)?;
        }

        Ok(())
    }

    /// Replace one project's job from a snapshot.
    ///
    /// An empty snapshot unschedules the project.
    pub fn schedule_project(&self, project: BackupProject) -> Result<()> {
        let Some(engine) = &self.engine else {
            return Err(Error::Config(format!(
                "no container engine available for project {}",
                project.project_name
            )));
        };

        let mut jobs = self.jobs.lock().expect("job book lock");

        if let Some(id) = jobs.projects.remove(&project.project_name) {
            info!(
                project = %project.project_name,
                "unscheduling container backup project"
            );
            self.scheduler.remove(id);
        }

        if project.containers.is_empty() {
            return Ok(());
        }

        let schedule = project.schedule.clone();
        let project_name = project.project_name.clone();

        if self.options.verbose {
            info!(project = %project_name, config = ?project, "scheduling container backup project");
        } else {
            info!(project = %project_name, "scheduling container backup project");
        }

        let job = Arc::new(ContainerProjectJob::new(
            self.cancel.clone(),
            engine.clone(),
            self.borg.clone(),
            self.options,
            project,
        )?);

        let id = self
            .scheduler
            .schedule(schedule, format!("project:{project_name}"), job);
        jobs.projects.insert(project_name, id);

        Ok(())
    }

    /// Main loop: dispatch scheduler plus watcher fan-in.
    ///
    /// Returns when cancelled; terminal watcher failures end the loop with
    /// an error.
    pub async fn run(
        &self,
        mut config_watch: ConfigWatch,
        engine_watch: Option<EngineWatch>,
    ) -> Result<()> {
        let scheduler = self.scheduler.clone();
        let scheduler_cancel = self.cancel.clone();
        let scheduler_task =
            tokio::spawn(async move { scheduler.run(scheduler_cancel).await });

        let (mut engine_updates, mut engine_errors) = match engine_watch {
            Some(watch) => (Some(watch.updates), Some(watch.errors)),
            None => (None, None),
        };
        let mut config_updates = Some(config_watch.updates);
        let mut config_errors = Some(config_watch.errors);

        let result = loop {
            tokio::select! {
                update = recv_opt(&mut config_updates) => {
                    match update {
                        Some(config) => {
                            self.borg.set_config(config.clone()).await;
                            self.schedule_repo_compaction(&config);
                            self.schedule_static_backups(&config.backups);
                        }
                        None => config_updates = None,
                    }
                }
                error = recv_opt(&mut config_errors) => {
                    match error {
                        Some(error) => break Err(error),
                        None => config_errors = None,
                    }
                }
                update = recv_opt(&mut engine_updates) => {
                    match update {
                        Some(project) => {
                            if let Err(e) = self.schedule_project(project) {
                                warn!(error = %e, "failed to schedule container backup project");
                            }
                        }
                        None => engine_updates = None,
                    }
                }
                error = recv_opt(&mut engine_errors) => {
                    match error {
                        Some(error) => break Err(error),
                        None => engine_errors = None,
                    }
                }
                _ = self.cancel.cancelled() => {
                    break Ok(());
                }
            }
        };

        self.cancel.cancel();
        let _ = scheduler_task.await;

        result
    }

    /// Run every scheduled job once, then compact. Used by `--once`.
    pub async fn run_once(&self) -> Result<()> {
        info!("executing all backup jobs once");

        self.scheduler.run_all_once().await;

        if let Err(e) = self.borg.compact(&self.cancel).await {
            debug!(error = %e, "compaction after one-shot run failed");
        }

        Ok(())
    }
}

async fn recv_opt<T>(receiver: &mut Option<tokio::sync::mpsc::Receiver<T>>) -> Option<T> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::borg::testing::recording_client;
    use crate::config::parse_standard;
    use crate::engine::testing::MockEngine;
    use crate::engine::{BackupMode, ContainerBackup, Mount};

    fn worker_with_engine() -> (Arc<MockEngine>, Worker) {
        let engine = Arc::new(MockEngine::new());
        let (_runner, borg) = recording_client();

        let worker = Worker::new(
            RuntimeOptions::default(),
            borg,
            Some(engine.clone()),
            Arc::new(Scheduler::new()),
            CancellationToken::new(),
        );

        (engine, worker)
    }

    fn project(name: &str, services: &[&str]) -> BackupProject {
        let containers: BTreeMap<String, ContainerBackup> = services
            .iter()
            .map(|service| {
                (
                    service.to_string(),
                    ContainerBackup {
                        id: format!("ctr-{service}"),
                        service_name: service.to_string(),
                        mode: BackupMode::Default,
                        upper_dir: None,
                        exec: None,
                        backup_volumes: vec![Mount {
                            kind: "volume".to_string(),
                            name: String::new(),
                            source: format!("/volumes/{service}"),
                            destination: format!("/data/{service}"),
                        }],
                        all_mounts: Vec::new(),
                        dependencies: Vec::new(),
                    },
                )
            })
            .collect();

        BackupProject {
            engine: "mock".to_string(),
            project_name: name.to_string(),
            schedule: parse_standard("0 4 * * *").unwrap(),
            containers,
        }
    }

    #[tokio::test]
    async fn test_project_snapshot_replaces_job() {
        let (_engine, worker) = worker_with_engine();

        worker.schedule_project(project("paper", &["db"])).unwrap();
        assert_eq!(worker.scheduler.len(), 1);

        // A new snapshot replaces, not duplicates.
        worker
            .schedule_project(project("paper", &["db", "redis"]))
            .unwrap();
        assert_eq!(worker.scheduler.len(), 1);

        // An empty snapshot unschedules.
        worker.schedule_project(project("paper", &[])).unwrap();
        assert_eq!(worker.scheduler.len(), 0);
    }

    #[tokio::test]
    async fn test_static_backups_are_replaced_wholesale() {
        let (_engine, worker) = worker_with_engine();

        let config = crate::borg::testing::test_config();
        worker.schedule_static_backups(&config.backups);
        assert_eq!(worker.scheduler.len(), 0);

        let backups = {
            use std::io::Write;
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(
                br#"
[Repo]
Location = "/srv/repo"

[[Backups]]
Name = "etc"
Schedule = "0 2 * * *"
Paths = { Paths = ["/etc"] }

[[Backups]]
Name = "home"
Schedule = "30 2 * * *"
Paths = { Paths = ["/home"] }
"#,
            )
            .unwrap();
            crate::config::load_config(file.path()).unwrap().backups
        };

        worker.schedule_static_backups(&backups);
        assert_eq!(worker.scheduler.len(), 2);

        worker.schedule_static_backups(&backups[..1]);
        assert_eq!(worker.scheduler.len(), 1);
    }

    #[tokio::test]
    async fn test_project_without_engine_is_rejected() {
        let (_runner, borg) = recording_client();
        let worker = Worker::new(
            RuntimeOptions::default(),
            borg,
            None,
            Arc::new(Scheduler::new()),
            CancellationToken::new(),
        );

        assert!(worker.schedule_project(project("paper", &["db"])).is_err());
    }

    #[tokio::test]
    async fn test_run_ends_on_watch_error() {
        let (_engine, worker) = worker_with_engine();

        let (config_updates_tx, updates) = tokio::sync::mpsc::channel(1);
        let (config_errors_tx, errors) = tokio::sync::mpsc::channel(1);
        let config_watch = ConfigWatch { updates, errors };

        config_errors_tx
            .send(Error::Config("config file vanished".to_string()))
            .await
            .unwrap();
        drop(config_updates_tx);

        let result = worker.run(config_watch, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_once_executes_all_jobs() {
        let engine = Arc::new(MockEngine::new());
        let (runner, borg) = recording_client();

        let worker = Worker::new(
            RuntimeOptions {
                once: true,
                ..Default::default()
            },
            borg,
            Some(engine.clone()),
            Arc::new(Scheduler::new()),
            CancellationToken::new(),
        );

        worker.schedule_project(project("paper", &["db"])).unwrap();
        worker.run_once().await.unwrap();

        // One archive from the project plus the trailing compact call.
        assert_eq!(runner.created_archives().len(), 1);
        assert!(runner
            .invocations()
            .iter()
            .any(|args| args.first().map(String::as_str) == Some("compact")));
    }
}
