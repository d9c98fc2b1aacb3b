use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use artillery_core::{decide, StatusSnapshot, TaskError, TaskName, TaskResult};
use artillery_storage::TaskStore;
use artillery_storage_fs::FsTaskStore;

use crate::{
    doctor::doctor, force_unlock, Config, DoctorCheck, ExecutionGuard, RunOutcome, StatusService, SystemProcessRunner,
};

/// What one trigger pass did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub ran: Vec<RunOutcome>,
    /// Due at decision time but locked by the time we got there.
    pub busy: Vec<TaskName>,
    pub errors: Vec<(TaskName, TaskError)>,
}

/// One trigger pass: every task whose decision at `now` is `Due` gets an
/// attempt. Attempts run side by side; the per-task lock keeps them from
/// overlapping with anything else.
pub fn run_due(store: &dyn TaskStore, guard: &ExecutionGuard<'_>, now: DateTime<Utc>) -> TaskResult<TickReport> {
    let due: Vec<TaskName> =
        store.list()?.into_iter().filter(|r| decide(r, now).is_due()).map(|r| r.name).collect();
    debug!(count = due.len(), "due tasks");

    let results: Vec<(TaskName, TaskResult<RunOutcome>)> = thread::scope(|s| {
        let handles: Vec<_> = due
            .into_iter()
            .map(|name| {
                s.spawn(move || {
                    let result = guard.execute(&name);
                    (name, result)
                })
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|h| match h.join() {
                Ok(r) => Some(r),
                Err(_) => {
                    warn!("a task attempt panicked");
                    None
                }
            })
            .collect()
    });

    let mut report = TickReport::default();
    for (name, result) in results {
        match result {
            Ok(outcome) => report.ran.push(outcome),
            Err(TaskError::AlreadyRunning { .. }) => report.busy.push(name),
            Err(e) => {
                warn!(task = %name, "attempt failed: {e}");
                report.errors.push((name, e));
            }
        }
    }
    Ok(report)
}

pub struct Runner {
    pub config_path: PathBuf,
    pub cfg: Config,
    pub store: FsTaskStore,
    pub process: SystemProcessRunner,
}

impl Runner {
    /// Loads the configuration, writing the default one on first use.
    pub fn open(config_path: PathBuf) -> Result<Self> {
        let cfg = if config_path.exists() {
            Config::load_from(&config_path)?
        } else {
            let cfg = Config::default();
            cfg.save_to(&config_path)?;
            info!(path = %config_path.display(), "wrote default configuration");
            cfg
        };
        let store = FsTaskStore::open(cfg.tasks_dir(), cfg.command_builder())
            .with_context(|| format!("open task store {}", cfg.tasks_dir().display()))?;
        let process = SystemProcessRunner::new(cfg.downloader.env.clone());
        Ok(Self { config_path, cfg, store, process })
    }

    pub fn init(config_path: &Path) -> Result<Config> {
        let cfg = if config_path.exists() {
            Config::load_from(config_path)?
        } else {
            let cfg = Config::default();
            cfg.save_to(config_path)?;
            cfg
        };
        for dir in [cfg.tasks_dir(), cfg.ledger_dir()] {
            std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(cfg)
    }

    pub fn doctor(&self) -> Vec<DoctorCheck> {
        doctor(&self.cfg)
    }

    pub fn guard(&self) -> ExecutionGuard<'_> {
        ExecutionGuard::new(&self.store, &self.process, self.cfg.stale_lock_policy())
    }

    pub fn status(&self, now: DateTime<Utc>) -> Result<StatusSnapshot> {
        Ok(StatusService::new(&self.store).snapshot(now)?)
    }

    pub fn run_due(&self, now: DateTime<Utc>) -> Result<TickReport> {
        Ok(run_due(&self.store, &self.guard(), now)?)
    }

    pub fn unlock(&self, name: &TaskName) -> Result<bool> {
        Ok(force_unlock(&self.store, name)?)
    }
}
