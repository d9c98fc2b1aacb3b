use chrono::{DateTime, Duration, Utc};

use crate::{DueState, TaskRecord};

/// Pure scheduling decision for one task. Cheap enough to recompute on
/// every poll; nothing is cached between calls.
///
/// Precedence: running, paused, manual-only, never run, interval check.
pub fn decide(record: &TaskRecord, now: DateTime<Utc>) -> DueState {
    if record.locked() {
        return DueState::Running;
    }
    if record.paused {
        return DueState::Paused;
    }
    if record.interval_minutes == 0 {
        return DueState::Idle;
    }
    match next_due(record) {
        None => DueState::Due,
        Some(next_due) if now >= next_due => DueState::Due,
        Some(next_due) => DueState::Waiting { next_due },
    }
}

/// `last_run_at + interval`, when both are known.
pub fn next_due(record: &TaskRecord) -> Option<DateTime<Utc>> {
    if record.interval_minutes == 0 {
        return None;
    }
    let last = record.last_run_at?;
    Some(last + Duration::minutes(i64::from(record.interval_minutes)))
}

/// When an existing lock marker may be reclaimed. A marker whose recorded
/// holder pid is gone is abandoned. A marker without a pid (`pid == 0`,
/// older tooling) is abandoned once older than `max_age`. A live holder is
/// never reclaimed. `max_age: None` disables reclaiming entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaleLockPolicy {
    pub max_age: Option<Duration>,
}

impl StaleLockPolicy {
    pub fn never() -> Self {
        Self { max_age: None }
    }

    pub fn after_minutes(minutes: u32) -> Self {
        if minutes == 0 {
            return Self::never();
        }
        Self { max_age: Some(Duration::minutes(i64::from(minutes))) }
    }

    /// `holder_alive` is whether `lock.pid` names a running process on
    /// this host; it is ignored for markers without a pid.
    pub fn is_stale(&self, lock: &crate::LockInfo, now: DateTime<Utc>, holder_alive: bool) -> bool {
        let Some(max_age) = self.max_age else {
            return false;
        };
        if lock.pid == 0 {
            return lock.age(now) > max_age;
        }
        !holder_alive
    }
}
