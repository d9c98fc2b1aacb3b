//! Single-flight execution of one task.
//!
//! The lock marker is held by a [`LockHandle`] for the whole attempt and
//! released on drop, so every exit path (success, non-zero exit, launch
//! failure, an early `?`, a panic) clears it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use artillery_core::{
    format_timestamp, now, LockInfo, LockOwner, RunId, StaleLockPolicy, TaskError, TaskName, TaskRecord, TaskResult,
};
use artillery_storage::TaskStore;

use crate::process::{pid_alive, ProcessRunner};

/// Result of one attempt. A failed download is still an `Ok(RunOutcome)`.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct RunOutcome {
    pub task: TaskName,
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub output: String,
    /// Set when the program could not be started.
    pub launch_error: Option<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.launch_error.is_none() && self.exit_code == Some(0)
    }

    pub fn summary(&self) -> String {
        match (&self.launch_error, self.exit_code) {
            (Some(e), _) => format!("failed to launch: {e}"),
            (None, Some(0)) => "finished successfully".to_string(),
            (None, Some(code)) => format!("exited with code {code}"),
            (None, None) => "terminated by signal".to_string(),
        }
    }
}

pub struct ExecutionGuard<'a> {
    store: &'a dyn TaskStore,
    runner: &'a dyn ProcessRunner,
    stale: StaleLockPolicy,
}

impl<'a> ExecutionGuard<'a> {
    pub fn new(store: &'a dyn TaskStore, runner: &'a dyn ProcessRunner, stale: StaleLockPolicy) -> Self {
        Self { store, runner, stale }
    }

    /// Runs the task now unless another attempt holds its lock, in which
    /// case this fails fast with `AlreadyRunning`. The record is read under
    /// the lock, so the argv is the one current when the run starts.
    pub fn execute(&self, name: &TaskName) -> TaskResult<RunOutcome> {
        let _lock = self.acquire(name)?;
        let record = self.store.read(name)?;

        let run_id = RunId::new();
        let started_at = now();
        self.store.touch_last_run(name, started_at)?;
        info!(task = %name, run_id = run_id.as_str(), "run started");

        let cwd = self.store.workdir(name);
        let result = self.runner.run(record.command_line.argv(), &cwd);
        let finished_at = now();
        let outcome = match result {
            Ok(out) => RunOutcome {
                task: name.clone(),
                run_id,
                started_at,
                finished_at,
                exit_code: out.exit_code,
                output: out.output,
                launch_error: None,
            },
            Err(e) => RunOutcome {
                task: name.clone(),
                run_id,
                started_at,
                finished_at,
                exit_code: None,
                output: String::new(),
                launch_error: Some(e.to_string()),
            },
        };

        self.store.append_log(name, &log_block(&record, &outcome))?;
        if outcome.succeeded() {
            info!(task = %name, run_id = outcome.run_id.as_str(), "run {}", outcome.summary());
        } else {
            warn!(task = %name, run_id = outcome.run_id.as_str(), "run {}", outcome.summary());
        }
        Ok(outcome)
    }

    fn acquire(&self, name: &TaskName) -> TaskResult<LockHandle<'a>> {
        let lock = LockInfo::new(now());
        if self.store.try_lock(name, &lock)? {
            return Ok(LockHandle::new(self.store, name, lock.owner));
        }

        let retry = match self.store.read(name)?.lock {
            // released between our attempt and the read
            None => true,
            Some(held) if self.stale.is_stale(&held, now(), pid_alive(held.pid)) => {
                warn!(
                    task = %name,
                    holder = held.owner.as_str(),
                    pid = held.pid,
                    since = %format_timestamp(held.acquired_at),
                    "reclaiming stale lock"
                );
                self.store.break_lock(name, &held)?
            }
            Some(_) => false,
        };
        if retry {
            let lock = LockInfo::new(now());
            if self.store.try_lock(name, &lock)? {
                return Ok(LockHandle::new(self.store, name, lock.owner));
            }
        }
        Err(TaskError::AlreadyRunning { name: name.to_string() })
    }
}

struct LockHandle<'a> {
    store: &'a dyn TaskStore,
    name: TaskName,
    owner: LockOwner,
}

impl<'a> LockHandle<'a> {
    fn new(store: &'a dyn TaskStore, name: &TaskName, owner: LockOwner) -> Self {
        debug!(task = %name, owner = owner.as_str(), "lock acquired");
        Self { store, name: name.clone(), owner }
    }
}

impl Drop for LockHandle<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_lock(&self.name, &self.owner) {
            warn!(task = %self.name, "failed to release lock: {e}");
        }
    }
}

/// Operator-initiated removal of whatever lock marker the task carries.
/// Returns whether a marker was removed.
pub fn force_unlock(store: &dyn TaskStore, name: &TaskName) -> TaskResult<bool> {
    match store.read(name)?.lock {
        Some(held) => {
            let broken = store.break_lock(name, &held)?;
            if broken {
                warn!(task = %name, holder = held.owner.as_str(), "lock cleared by operator");
            }
            Ok(broken)
        }
        None => Ok(false),
    }
}

fn log_block(record: &TaskRecord, outcome: &RunOutcome) -> String {
    let mut block = format!(
        "=== run {} started {} ===\n$ {}\n",
        outcome.run_id.as_str(),
        format_timestamp(outcome.started_at),
        record.command_line
    );
    block.push_str(&outcome.output);
    if !outcome.output.is_empty() && !outcome.output.ends_with('\n') {
        block.push('\n');
    }
    block.push_str(&format!("=== {} at {} ===\n", outcome.summary(), format_timestamp(outcome.finished_at)));
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessOutput;
    use artillery_core::{CommandBuilder, OptionSet, TaskDraft};
    use artillery_storage::InMemoryTaskStore;
    use std::io;
    use std::path::Path;
    use std::sync::Mutex;

    struct Scripted(Mutex<Vec<io::Result<ProcessOutput>>>);

    impl ProcessRunner for Scripted {
        fn run(&self, _argv: &[String], _cwd: &Path) -> io::Result<ProcessOutput> {
            self.0.lock().unwrap().remove(0)
        }
    }

    fn setup() -> (InMemoryTaskStore, TaskName) {
        let store = InMemoryTaskStore::new(CommandBuilder::new("gallery-dl", vec![], "/ledgers"));
        let name = TaskName::parse("t").unwrap();
        store.create(TaskDraft::new(name.clone(), vec!["https://a".into()], 10, OptionSet::default())).unwrap();
        (store, name)
    }

    #[test]
    fn summary_wording() {
        let (store, name) = setup();
        let runner = Scripted(Mutex::new(vec![
            Ok(ProcessOutput { output: "ok".into(), exit_code: Some(0) }),
            Ok(ProcessOutput { output: String::new(), exit_code: None }),
        ]));
        let guard = ExecutionGuard::new(&store, &runner, StaleLockPolicy::never());
        assert_eq!(guard.execute(&name).unwrap().summary(), "finished successfully");
        assert_eq!(guard.execute(&name).unwrap().summary(), "terminated by signal");
    }

    #[test]
    fn log_block_has_header_output_and_footer() {
        let (store, name) = setup();
        let runner = Scripted(Mutex::new(vec![Ok(ProcessOutput { output: "line".into(), exit_code: Some(1) })]));
        let outcome = ExecutionGuard::new(&store, &runner, StaleLockPolicy::never()).execute(&name).unwrap();
        let log = store.read_log(&name).unwrap().unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with(&format!("=== run {} started ", outcome.run_id.as_str())));
        assert_eq!(lines[1], "$ gallery-dl -i url_list.txt");
        assert_eq!(lines[2], "line");
        assert!(lines[3].starts_with("=== exited with code 1 at "));
    }

    #[test]
    fn force_unlock_clears_any_holder() {
        let (store, name) = setup();
        assert!(!force_unlock(&store, &name).unwrap());
        store.try_lock(&name, &LockInfo::new(now())).unwrap();
        assert!(force_unlock(&store, &name).unwrap());
        assert!(!store.read(&name).unwrap().locked());
    }
}
