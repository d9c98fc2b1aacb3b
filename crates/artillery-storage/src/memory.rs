use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use artillery_core::{
    CommandBuilder, LockInfo, LockOwner, OptionSet, TaskDraft, TaskError, TaskName, TaskPatch, TaskRecord,
    TaskResult,
};
use chrono::{DateTime, Utc};

use crate::traits::TaskStore;

/// In-memory store for tests. Not durable, but enforces the same rules as
/// the filesystem store.
pub struct InMemoryTaskStore {
    builder: CommandBuilder,
    workdir_root: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<TaskName, Stored>,
    ledgers: BTreeSet<TaskName>,
}

#[derive(Clone)]
struct Stored {
    input_list: Vec<String>,
    interval_minutes: u32,
    options: OptionSet,
    last_run_at: Option<DateTime<Utc>>,
    paused: bool,
    lock: Option<LockInfo>,
    log: Option<String>,
}

impl InMemoryTaskStore {
    pub fn new(builder: CommandBuilder) -> Self {
        Self { builder, workdir_root: std::env::temp_dir().join("artillery-memory"), inner: Mutex::default() }
    }

    /// Pretends the downloader wrote a dedup ledger for `name`.
    pub fn add_archive(&self, name: &TaskName) {
        self.inner().ledgers.insert(name.clone());
    }

    pub fn has_archive(&self, name: &TaskName) -> bool {
        self.inner().ledgers.contains(name)
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn to_record(&self, name: &TaskName, s: &Stored) -> TaskResult<TaskRecord> {
        let command_line = self.builder.build(name, &s.input_list, &s.options)?;
        Ok(TaskRecord {
            name: name.clone(),
            input_list: s.input_list.clone(),
            interval_minutes: s.interval_minutes,
            options: s.options.clone(),
            command_line,
            last_run_at: s.last_run_at,
            paused: s.paused,
            lock: s.lock.clone(),
            has_log: s.log.is_some(),
        })
    }
}

fn not_found(name: &TaskName) -> TaskError {
    TaskError::NotFound { name: name.to_string() }
}

impl TaskStore for InMemoryTaskStore {
    fn create(&self, draft: TaskDraft) -> TaskResult<TaskRecord> {
        draft.validate()?;
        self.builder.build(&draft.name, &draft.input_list, &draft.options)?;
        let mut inner = self.inner();
        if inner.tasks.contains_key(&draft.name) {
            return Err(TaskError::AlreadyExists { name: draft.name.to_string() });
        }
        let stored = Stored {
            input_list: draft.input_list,
            interval_minutes: draft.interval_minutes,
            options: draft.options,
            last_run_at: None,
            paused: false,
            lock: None,
            log: None,
        };
        let record = self.to_record(&draft.name, &stored)?;
        inner.tasks.insert(draft.name, stored);
        Ok(record)
    }

    fn read(&self, name: &TaskName) -> TaskResult<TaskRecord> {
        let inner = self.inner();
        let stored = inner.tasks.get(name).ok_or_else(|| not_found(name))?;
        self.to_record(name, stored)
    }

    fn list(&self) -> TaskResult<Vec<TaskRecord>> {
        let inner = self.inner();
        let mut out = Vec::with_capacity(inner.tasks.len());
        for (name, stored) in &inner.tasks {
            match self.to_record(name, stored) {
                Ok(record) => out.push(record),
                Err(e) => tracing::warn!(task = %name, "skipping task: {e}"),
            }
        }
        Ok(out)
    }

    fn update(&self, name: &TaskName, patch: TaskPatch) -> TaskResult<TaskRecord> {
        let current = self.read(name)?;
        let draft = patch.apply_to(&current)?;
        self.builder.build(name, &draft.input_list, &draft.options)?;
        let mut inner = self.inner();
        let stored = inner.tasks.get_mut(name).ok_or_else(|| not_found(name))?;
        stored.input_list = draft.input_list;
        stored.interval_minutes = draft.interval_minutes;
        stored.options = draft.options;
        let stored = stored.clone();
        drop(inner);
        self.to_record(name, &stored)
    }

    fn set_paused(&self, name: &TaskName, paused: bool) -> TaskResult<()> {
        let mut inner = self.inner();
        inner.tasks.get_mut(name).ok_or_else(|| not_found(name))?.paused = paused;
        Ok(())
    }

    fn touch_last_run(&self, name: &TaskName, at: DateTime<Utc>) -> TaskResult<()> {
        let mut inner = self.inner();
        let stored = inner.tasks.get_mut(name).ok_or_else(|| not_found(name))?;
        if stored.last_run_at.map_or(true, |prev| at >= prev) {
            stored.last_run_at = Some(at);
        }
        Ok(())
    }

    fn append_log(&self, name: &TaskName, text: &str) -> TaskResult<()> {
        let mut inner = self.inner();
        let stored = inner.tasks.get_mut(name).ok_or_else(|| not_found(name))?;
        stored.log.get_or_insert_with(String::new).push_str(text);
        Ok(())
    }

    fn read_log(&self, name: &TaskName) -> TaskResult<Option<String>> {
        let inner = self.inner();
        Ok(inner.tasks.get(name).ok_or_else(|| not_found(name))?.log.clone())
    }

    fn delete(&self, name: &TaskName) -> TaskResult<()> {
        let mut inner = self.inner();
        match inner.tasks.get(name) {
            None => Err(not_found(name)),
            Some(s) if s.lock.is_some() => Err(TaskError::AlreadyRunning { name: name.to_string() }),
            Some(_) => {
                inner.tasks.remove(name);
                Ok(())
            }
        }
    }

    fn delete_archive(&self, name: &TaskName) -> TaskResult<bool> {
        Ok(self.inner().ledgers.remove(name))
    }

    fn try_lock(&self, name: &TaskName, lock: &LockInfo) -> TaskResult<bool> {
        let mut inner = self.inner();
        let stored = inner.tasks.get_mut(name).ok_or_else(|| not_found(name))?;
        if stored.lock.is_some() {
            return Ok(false);
        }
        stored.lock = Some(lock.clone());
        Ok(true)
    }

    fn break_lock(&self, name: &TaskName, expected: &LockInfo) -> TaskResult<bool> {
        let mut inner = self.inner();
        let stored = inner.tasks.get_mut(name).ok_or_else(|| not_found(name))?;
        if stored.lock.as_ref() == Some(expected) {
            stored.lock = None;
            return Ok(true);
        }
        Ok(false)
    }

    fn release_lock(&self, name: &TaskName, owner: &LockOwner) -> TaskResult<()> {
        let mut inner = self.inner();
        if let Some(stored) = inner.tasks.get_mut(name) {
            if stored.lock.as_ref().is_some_and(|l| &l.owner == owner) {
                stored.lock = None;
            }
        }
        Ok(())
    }

    fn workdir(&self, name: &TaskName) -> PathBuf {
        self.workdir_root.join(name.as_str())
    }
}
