use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::{decide, next_due, DueState, TaskName, TaskRecord};

/// Read-only view of one task for status pollers. Built fresh on every
/// poll from the record and "now".
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct TaskStatusView {
    pub name: TaskName,
    pub display_name: String,
    /// Bare label; the due time is carried by `next_due`.
    #[serde(serialize_with = "state_label")]
    pub state: DueState,
    pub interval_minutes: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_due: Option<DateTime<Utc>>,
    pub paused: bool,
    pub has_log: bool,
    pub command_line: String,
}

impl TaskStatusView {
    pub fn from_record(record: &TaskRecord, now: DateTime<Utc>) -> Self {
        Self {
            name: record.name.clone(),
            display_name: record.name.display_name(),
            state: decide(record, now),
            interval_minutes: record.interval_minutes,
            last_run_at: record.last_run_at,
            // a paused task has no meaningful next run
            next_due: if record.paused { None } else { next_due(record) },
            paused: record.paused,
            has_log: record.has_log,
            command_line: record.command_line.to_string(),
        }
    }
}

fn state_label<S: Serializer>(state: &DueState, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(state.label())
}

/// All tasks at one instant, sorted by name.
#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub now: DateTime<Utc>,
    pub tasks: Vec<TaskStatusView>,
}

impl StatusSnapshot {
    pub fn due(&self) -> impl Iterator<Item = &TaskStatusView> {
        self.tasks.iter().filter(|t| t.state.is_due())
    }
}
