//! One directory per task under `root`, one file per field.
//!
//! Whole-file writes go through a temp file in the same directory and a
//! rename, so a concurrent reader sees either the old or the new value.
//! The lock marker is created with `create_new` and is the only
//! mutual-exclusion primitive.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use artillery_core::{
    format_timestamp, parse_command_line, parse_input_list, parse_timestamp, CommandBuilder, CommandLine, InputMode,
    LockInfo, LockOwner, OptionSet, TaskDraft, TaskError, TaskName, TaskPatch, TaskRecord, TaskResult, COOKIE_FILE,
    DEFAULT_INPUT_FILE,
};
use artillery_storage::TaskStore;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const INTERVAL_FILE: &str = "interval.txt";
pub const OPTIONS_FILE: &str = "options.json";
pub const COMMAND_FILE: &str = "command.txt";
pub const LAST_RUN_FILE: &str = "last_run.txt";
pub const PAUSED_FILE: &str = "paused.txt";
pub const LOCK_FILE: &str = "lockfile";
pub const LOG_FILE: &str = "task.log";

const RESERVED_FILES: [&str; 8] =
    [INTERVAL_FILE, OPTIONS_FILE, COMMAND_FILE, LAST_RUN_FILE, PAUSED_FILE, LOCK_FILE, LOG_FILE, COOKIE_FILE];

/// Prefix of lock markers moved aside while being broken.
const BROKEN_LOCK_PREFIX: &str = ".lockfile.broken.";

fn is_reserved(file: &str) -> bool {
    RESERVED_FILES.contains(&file) || file.starts_with(BROKEN_LOCK_PREFIX)
}

/// Extra copy of the input list kept under a custom list file name.
fn mirrored_list(options: &OptionSet) -> Option<&str> {
    match &options.input {
        InputMode::List { file } if file.trim() != DEFAULT_INPUT_FILE => Some(file.trim()),
        _ => None,
    }
}

/// Owner recorded for lock markers that are not JSON (written by older
/// tooling, or caught mid-write).
const LEGACY_OWNER: &str = "legacy";

#[derive(Clone, Debug)]
pub struct FsTaskStore {
    root: PathBuf,
    builder: CommandBuilder,
}

impl FsTaskStore {
    /// Creates the tasks and ledger directories if needed.
    pub fn open(root: impl Into<PathBuf>, builder: CommandBuilder) -> TaskResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| TaskError::io(&root, e))?;
        fs::create_dir_all(&builder.ledger_dir).map_err(|e| TaskError::io(&builder.ledger_dir, e))?;
        Ok(Self { root, builder })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn builder(&self) -> &CommandBuilder {
        &self.builder
    }

    fn task_dir(&self, name: &TaskName) -> PathBuf {
        self.root.join(name.as_str())
    }

    fn existing_dir(&self, name: &TaskName) -> TaskResult<PathBuf> {
        let dir = self.task_dir(name);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(TaskError::NotFound { name: name.to_string() })
        }
    }

    fn build_checked(&self, name: &TaskName, input_list: &[String], options: &OptionSet) -> TaskResult<CommandLine> {
        if let InputMode::List { file } = &options.input {
            if is_reserved(file.trim()) {
                return Err(TaskError::validation(format!("list file {file:?} collides with a task record file")));
            }
        }
        self.builder.build(name, input_list, options)
    }

    fn write_definition(
        &self,
        dir: &Path,
        input_list: &[String],
        interval_minutes: u32,
        options: &OptionSet,
        command: &CommandLine,
    ) -> TaskResult<()> {
        let mut list = input_list.join("\n");
        list.push('\n');
        write_atomic(&dir.join(DEFAULT_INPUT_FILE), list.as_bytes())?;
        if let Some(file) = mirrored_list(options) {
            write_atomic(&dir.join(file), list.as_bytes())?;
        }
        write_atomic(&dir.join(INTERVAL_FILE), interval_minutes.to_string().as_bytes())?;
        let json = serde_json::to_vec_pretty(options)
            .map_err(|e| TaskError::validation(format!("options are not serialisable: {e}")))?;
        write_atomic(&dir.join(OPTIONS_FILE), &json)?;
        write_atomic(&dir.join(COMMAND_FILE), command.to_string().as_bytes())
    }

    fn load(&self, name: &TaskName, dir: &Path) -> TaskResult<TaskRecord> {
        let corrupt = |reason: String| TaskError::Corrupt { name: name.to_string(), reason };

        let persisted_command = read_opt(&dir.join(COMMAND_FILE))?;
        let options = match read_opt(&dir.join(OPTIONS_FILE))? {
            Some(json) => serde_json::from_str::<OptionSet>(&json).map_err(|e| corrupt(format!("{OPTIONS_FILE}: {e}")))?,
            None => match &persisted_command {
                Some(line) => {
                    debug!(task = %name, "no {OPTIONS_FILE}; recovering options from {COMMAND_FILE}");
                    parse_command_line(line).map_err(|e| corrupt(format!("{COMMAND_FILE}: {e}")))?
                }
                None => return Err(corrupt(format!("neither {OPTIONS_FILE} nor {COMMAND_FILE} present"))),
            },
        };

        let mut list_text = read_opt(&dir.join(DEFAULT_INPUT_FILE))?;
        if list_text.is_none() {
            if let InputMode::List { file } = &options.input {
                list_text = read_opt(&dir.join(file.trim()))?;
            }
        }
        let input_list = list_text.as_deref().map(parse_input_list).unwrap_or_default();

        let interval_minutes = match read_opt(&dir.join(INTERVAL_FILE))? {
            Some(raw) => raw.trim().parse::<u32>().unwrap_or_else(|_| {
                warn!(task = %name, value = raw.trim(), "unparsable interval; treating task as manual-only");
                0
            }),
            None => 0,
        };

        let last_run_at = match read_opt(&dir.join(LAST_RUN_FILE))? {
            Some(raw) => {
                let ts = parse_timestamp(&raw);
                if ts.is_none() {
                    warn!(task = %name, value = raw.trim(), "unparsable last run timestamp; ignoring it");
                }
                ts
            }
            None => None,
        };

        let command_line =
            self.builder.build(name, &input_list, &options).map_err(|e| corrupt(e.to_string()))?;
        if let Some(persisted) = &persisted_command {
            if persisted.trim() != command_line.to_string() {
                warn!(task = %name, "{COMMAND_FILE} differs from the derived command; it is rewritten on the next edit");
            }
        }

        Ok(TaskRecord {
            name: name.clone(),
            input_list,
            interval_minutes,
            options,
            command_line,
            last_run_at,
            paused: dir.join(PAUSED_FILE).exists(),
            lock: read_lock(&dir.join(LOCK_FILE))?,
            has_log: dir.join(LOG_FILE).exists(),
        })
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> TaskResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| TaskError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| TaskError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| TaskError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| TaskError::io(path, e.error))?;
    Ok(())
}

fn read_opt(path: &Path) -> TaskResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TaskError::io(path, e)),
    }
}

fn remove_opt(path: &Path) -> TaskResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(TaskError::io(path, e)),
    }
}

fn read_lock(path: &Path) -> TaskResult<Option<LockInfo>> {
    let Some(raw) = read_opt(path)? else {
        return Ok(None);
    };
    if let Ok(lock) = serde_json::from_str::<LockInfo>(&raw) {
        return Ok(Some(lock));
    }
    let acquired_at = fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(Some(LockInfo { owner: LockOwner::from_str(LEGACY_OWNER), pid: 0, acquired_at }))
}

impl TaskStore for FsTaskStore {
    fn create(&self, draft: TaskDraft) -> TaskResult<TaskRecord> {
        draft.validate()?;
        let command = self.build_checked(&draft.name, &draft.input_list, &draft.options)?;

        let dir = self.task_dir(&draft.name);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(TaskError::AlreadyExists { name: draft.name.to_string() });
            }
            Err(e) => return Err(TaskError::io(&dir, e)),
        }

        if let Err(e) = self.write_definition(&dir, &draft.input_list, draft.interval_minutes, &draft.options, &command) {
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                warn!(task = %draft.name, "failed to remove partial task dir: {cleanup}");
            }
            return Err(e);
        }
        info!(task = %draft.name, interval = draft.interval_minutes, "task created");
        self.load(&draft.name, &dir)
    }

    fn read(&self, name: &TaskName) -> TaskResult<TaskRecord> {
        let dir = self.existing_dir(name)?;
        self.load(name, &dir)
    }

    fn list(&self) -> TaskResult<Vec<TaskRecord>> {
        let entries = fs::read_dir(&self.root).map_err(|e| TaskError::io(&self.root, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TaskError::io(&self.root, e))?;
            let path = entry.path();
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let raw = entry.file_name().to_string_lossy().into_owned();
            if raw.starts_with('.') {
                continue;
            }
            let Ok(name) = TaskName::parse(&raw) else {
                debug!(dir = %path.display(), "skipping directory with an invalid task name");
                continue;
            };
            if !path.join(COMMAND_FILE).exists() && !path.join(INTERVAL_FILE).exists() {
                debug!(dir = %path.display(), "skipping directory that is not a task record");
                continue;
            }
            match self.load(&name, &path) {
                Ok(record) => out.push(record),
                Err(e) => warn!(task = %name, "skipping task: {e}"),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn update(&self, name: &TaskName, patch: TaskPatch) -> TaskResult<TaskRecord> {
        let current = self.read(name)?;
        let draft = patch.apply_to(&current)?;
        let command = self.build_checked(name, &draft.input_list, &draft.options)?;
        let dir = self.task_dir(name);
        self.write_definition(&dir, &draft.input_list, draft.interval_minutes, &draft.options, &command)?;
        if let Some(old) = mirrored_list(&current.options) {
            if mirrored_list(&draft.options) != Some(old) && !is_reserved(old) {
                remove_opt(&dir.join(old))?;
                debug!(task = %name, file = old, "removed previous list file");
            }
        }
        info!(task = %name, interval = draft.interval_minutes, "task updated");
        self.load(name, &dir)
    }

    fn set_paused(&self, name: &TaskName, paused: bool) -> TaskResult<()> {
        let path = self.existing_dir(name)?.join(PAUSED_FILE);
        if paused {
            write_atomic(&path, b"1")?;
        } else {
            remove_opt(&path)?;
        }
        info!(task = %name, paused, "pause flag set");
        Ok(())
    }

    fn touch_last_run(&self, name: &TaskName, at: DateTime<Utc>) -> TaskResult<()> {
        let path = self.existing_dir(name)?.join(LAST_RUN_FILE);
        if let Some(prev) = read_opt(&path)?.as_deref().and_then(parse_timestamp) {
            if at < prev {
                debug!(task = %name, "ignoring last run older than the stored one");
                return Ok(());
            }
        }
        write_atomic(&path, format_timestamp(at).as_bytes())
    }

    fn append_log(&self, name: &TaskName, text: &str) -> TaskResult<()> {
        let path = self.existing_dir(name)?.join(LOG_FILE);
        let mut f = OpenOptions::new().create(true).append(true).open(&path).map_err(|e| TaskError::io(&path, e))?;
        f.write_all(text.as_bytes()).map_err(|e| TaskError::io(&path, e))
    }

    fn read_log(&self, name: &TaskName) -> TaskResult<Option<String>> {
        read_opt(&self.existing_dir(name)?.join(LOG_FILE))
    }

    fn delete(&self, name: &TaskName) -> TaskResult<()> {
        let dir = self.existing_dir(name)?;
        if dir.join(LOCK_FILE).exists() {
            return Err(TaskError::AlreadyRunning { name: name.to_string() });
        }
        fs::remove_dir_all(&dir).map_err(|e| TaskError::io(&dir, e))?;
        info!(task = %name, "task deleted");
        Ok(())
    }

    fn delete_archive(&self, name: &TaskName) -> TaskResult<bool> {
        let removed = remove_opt(&self.builder.ledger_path(name))?;
        if removed {
            info!(task = %name, "download archive deleted");
        }
        Ok(removed)
    }

    fn try_lock(&self, name: &TaskName, lock: &LockInfo) -> TaskResult<bool> {
        let path = self.existing_dir(name)?.join(LOCK_FILE);
        let mut f = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(TaskError::io(&path, e)),
        };
        let json = serde_json::to_vec(lock).map_err(|e| TaskError::validation(e.to_string()))?;
        if let Err(e) = f.write_all(&json).and_then(|()| f.sync_all()) {
            drop(f);
            remove_opt(&path)?;
            return Err(TaskError::io(&path, e));
        }
        debug!(task = %name, owner = lock.owner.as_str(), "lock acquired");
        Ok(true)
    }

    fn break_lock(&self, name: &TaskName, expected: &LockInfo) -> TaskResult<bool> {
        let dir = self.existing_dir(name)?;
        let path = dir.join(LOCK_FILE);
        if read_lock(&path)?.as_ref() != Some(expected) {
            return Ok(false);
        }

        // Move the marker aside first; only one breaker can win the rename.
        let aside = dir.join(format!("{BROKEN_LOCK_PREFIX}{}", LockOwner::new().as_str()));
        match fs::rename(&path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(TaskError::io(&path, e)),
        }
        let taken = read_lock(&aside)?;
        if taken.as_ref() != Some(expected) {
            // Raced with a release and a fresh acquire; put it back unless
            // yet another holder already exists.
            if let Err(e) = fs::hard_link(&aside, &path) {
                warn!(task = %name, "could not restore a lock moved aside: {e}");
            }
            remove_opt(&aside)?;
            return Ok(false);
        }
        remove_opt(&aside)?;
        warn!(task = %name, owner = expected.owner.as_str(), "lock broken");
        Ok(true)
    }

    fn release_lock(&self, name: &TaskName, owner: &LockOwner) -> TaskResult<()> {
        let path = self.task_dir(name).join(LOCK_FILE);
        match read_lock(&path)? {
            Some(lock) if &lock.owner == owner => {
                remove_opt(&path)?;
                debug!(task = %name, "lock released");
            }
            Some(lock) => {
                warn!(task = %name, holder = lock.owner.as_str(), "not releasing a lock held by someone else");
            }
            None => {}
        }
        Ok(())
    }

    fn workdir(&self, name: &TaskName) -> PathBuf {
        self.task_dir(name)
    }
}
