use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File the input list is persisted to inside the task directory.
pub const DEFAULT_INPUT_FILE: &str = "url_list.txt";

/// How the downloader consumes the task's input list. Only one input
/// argument group is ever emitted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InputMode {
    /// `-i <file>`: read the persisted list; repeatable, non-destructive.
    List { file: String },
    /// `-I <filter> <url>`: first non-empty input line, filtered.
    FilterSingle { filter: String },
}

impl Default for InputMode {
    fn default() -> Self {
        Self::List { file: DEFAULT_INPUT_FILE.to_string() }
    }
}

/// Scheduling state of one task at one instant.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DueState {
    /// Manual-only task (interval 0), not running.
    Idle,
    Running,
    Paused,
    Due,
    Waiting { next_due: DateTime<Utc> },
}

impl DueState {
    pub fn label(&self) -> &'static str {
        match self {
            DueState::Idle => "idle",
            DueState::Running => "running",
            DueState::Paused => "paused",
            DueState::Due => "due",
            DueState::Waiting { .. } => "waiting",
        }
    }

    pub fn is_due(&self) -> bool {
        matches!(self, DueState::Due)
    }
}
