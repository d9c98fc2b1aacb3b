use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{CommandLine, InputMode, LockOwner, TaskError, TaskName, TaskResult};

/// Anything longer than a year is almost certainly a typo.
pub const MAX_INTERVAL_MINUTES: u32 = 525_600;

/// Present-if-true downloader switches.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Toggles {
    pub write_unsupported: bool,
    pub no_skip: bool,
    pub write_metadata: bool,
    pub write_info_json: bool,
    pub write_tags: bool,
}

/// Free-text options bound to a flag. Blank values are treated as absent.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValuedOptions {
    pub retries: Option<String>,
    pub limit_rate: Option<String>,
    pub sleep: Option<String>,
    pub sleep_request: Option<String>,
    pub sleep_429: Option<String>,
    pub sleep_extractor: Option<String>,
    pub rename: Option<String>,
    pub rename_to: Option<String>,
}

/// User-chosen downloader configuration for one task. Persisted as
/// `options.json`; the command line is always derived from it.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OptionSet {
    pub input: InputMode,
    pub toggles: Toggles,
    pub values: ValuedOptions,
    pub download_archive: bool,
    pub cookies: bool,
}

/// Contents of the lock marker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub owner: LockOwner,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { owner: LockOwner::new(), pid: std::process::id(), acquired_at: now }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.acquired_at
    }
}

/// Everything needed to create a task in one step.
#[derive(Clone, Debug)]
pub struct TaskDraft {
    pub name: TaskName,
    pub input_list: Vec<String>,
    pub interval_minutes: u32,
    pub options: OptionSet,
}

impl TaskDraft {
    pub fn new(name: TaskName, input_list: Vec<String>, interval_minutes: u32, options: OptionSet) -> Self {
        Self { name, input_list: normalize_input_list(&input_list), interval_minutes, options }
    }

    pub fn validate(&self) -> TaskResult<()> {
        if self.input_list.is_empty() {
            return Err(TaskError::validation("input list must contain at least one entry"));
        }
        validate_interval(self.interval_minutes)?;
        Ok(())
    }
}

/// User edit of an existing task. `None` keeps the current value; the
/// name is deliberately not part of it.
#[derive(Clone, Debug, Default)]
pub struct TaskPatch {
    pub input_list: Option<Vec<String>>,
    pub interval_minutes: Option<u32>,
    pub options: Option<OptionSet>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.input_list.is_none() && self.interval_minutes.is_none() && self.options.is_none()
    }

    /// Applies the patch to a copy of the current definition and validates
    /// the result, so nothing is written for an invalid edit.
    pub fn apply_to(&self, current: &TaskRecord) -> TaskResult<TaskDraft> {
        let draft = TaskDraft::new(
            current.name.clone(),
            self.input_list.clone().unwrap_or_else(|| current.input_list.clone()),
            self.interval_minutes.unwrap_or(current.interval_minutes),
            self.options.clone().unwrap_or_else(|| current.options.clone()),
        );
        draft.validate()?;
        Ok(draft)
    }
}

/// Full durable state of one task as seen by readers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRecord {
    pub name: TaskName,
    pub input_list: Vec<String>,
    pub interval_minutes: u32,
    pub options: OptionSet,
    pub command_line: CommandLine,
    pub last_run_at: Option<DateTime<Utc>>,
    pub paused: bool,
    pub lock: Option<LockInfo>,
    pub has_log: bool,
}

impl TaskRecord {
    pub fn locked(&self) -> bool {
        self.lock.is_some()
    }
}

pub fn validate_interval(minutes: u32) -> TaskResult<u32> {
    if minutes > MAX_INTERVAL_MINUTES {
        return Err(TaskError::validation(format!(
            "interval of {minutes} minutes exceeds the maximum of {MAX_INTERVAL_MINUTES}"
        )));
    }
    Ok(minutes)
}

/// Splits multi-line entries, trims every line and drops blanks.
pub fn normalize_input_list(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .flat_map(|l| l.lines())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_input_list(text: &str) -> Vec<String> {
    normalize_input_list(&[text.to_string()])
}
