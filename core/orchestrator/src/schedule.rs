//! Cron-driven job scheduling.
//!
//! Dispatch decisions happen on a single loop; every firing runs in its own
//! task wrapped in the "skip if still running" and "recover from panic"
//! combinators: an invocation whose predecessor has not returned is skipped,
//! and a panicking job never takes the scheduler down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A schedulable unit of work.
///
/// Jobs report failures by logging; returning normally is success as far as
/// the scheduler is concerned.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self);
}

/// Handle identifying a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

struct Entry {
    label: String,
    schedule: Schedule,
    job: Arc<dyn Job>,
    running: Arc<tokio::sync::Mutex<()>>,
    next: Option<DateTime<Utc>>,
}

/// Cron scheduler with single-threaded dispatch.
pub struct Scheduler {
    entries: Mutex<HashMap<JobId, Entry>>,
    next_id: AtomicU64,
    changed: Notify,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            changed: Notify::new(),
        }
    }

    /// Register a job and return its handle.
    pub fn schedule(
        &self,
        schedule: Schedule,
        label: impl Into<String>,
        job: Arc<dyn Job>,
    ) -> JobId {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let next = schedule.after(&Utc::now()).next();

        self.entries.lock().expect("scheduler lock").insert(
            id,
            Entry {
                label: label.into(),
                schedule,
                job,
                running: Arc::new(tokio::sync::Mutex::new(())),
                next,
            },
        );

        self.changed.notify_one();
        id
    }

    /// Remove a job by handle.
    pub fn remove(&self, id: JobId) -> bool {
        let removed = self
            .entries
            .lock()
            .expect("scheduler lock")
            .remove(&id)
            .is_some();

        if removed {
            self.changed.notify_one();
        }

        removed
    }

    /// Number of registered jobs.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("scheduler lock").len()
    }

    /// Whether no jobs are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered job once, sequentially, bypassing schedules.
    pub async fn run_all_once(&self) {
        let jobs: Vec<(String, Arc<dyn Job>)> = {
            let entries = self.entries.lock().expect("scheduler lock");
            entries
                .values()
                .map(|entry| (entry.label.clone(), entry.job.clone()))
                .collect()
        };

        for (label, job) in jobs {
            info!(job = %label, "running job once");
            job.run().await;
        }
    }

    /// Dispatch loop; returns when `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("starting cron scheduler");

        loop {
            let now = Utc::now();
            let mut due = Vec::new();
            let mut next_wake: Option<DateTime<Utc>> = None;

            {
                let mut entries = self.entries.lock().expect("scheduler lock");
                for entry in entries.values_mut() {
                    match entry.next {
                        Some(next) if next <= now => {
                            due.push((
                                entry.label.clone(),
                                entry.job.clone(),
                                entry.running.clone(),
                            ));
                            entry.next = entry.schedule.after(&now).next();
                        }
                        _ => {}
                    }

                    if let Some(next) = entry.next {
                        next_wake = Some(match next_wake {
                            Some(current) if current <= next => current,
                            _ => next,
                        });
                    }
                }
            }

            for (label, job, running) in due {
                spawn_guarded(label, job, running);
            }

            let sleep = next_wake
                .map(|wake| {
                    (wake - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::from_millis(0))
                })
                .unwrap_or(Duration::from_secs(3600));

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.changed.notified() => {}
                _ = cancel.cancelled() => {
                    info!("cron scheduler shutting down");
                    return;
                }
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Fire one job invocation under the scheduler's combinators.
fn spawn_guarded(label: String, job: Arc<dyn Job>, running: Arc<tokio::sync::Mutex<()>>) {
    let guard = match running.try_lock_owned() {
        Ok(guard) => guard,
        Err(_) => {
            info!(job = %label, "previous invocation still running, skipping");
            return;
        }
    };

    let task_label = label.clone();
    let handle = tokio::spawn(async move {
        let _guard = guard;
        debug!(job = %task_label, "job started");
        job.run().await;
        debug!(job = %task_label, "job finished");
    });

    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(job = %label, "job panicked, recovering");
            }
        }
    });
}
