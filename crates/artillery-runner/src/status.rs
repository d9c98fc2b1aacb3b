use chrono::{DateTime, Utc};

use artillery_core::{StatusSnapshot, TaskName, TaskResult, TaskStatusView};
use artillery_storage::TaskStore;

/// Read-only status for pollers. Never takes a lock and never caches, so
/// each call reflects the store as it is at `now`.
pub struct StatusService<'a> {
    store: &'a dyn TaskStore,
}

impl<'a> StatusService<'a> {
    pub fn new(store: &'a dyn TaskStore) -> Self {
        Self { store }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> TaskResult<StatusSnapshot> {
        let tasks = self.store.list()?.iter().map(|r| TaskStatusView::from_record(r, now)).collect();
        Ok(StatusSnapshot { now, tasks })
    }

    pub fn task(&self, name: &TaskName, now: DateTime<Utc>) -> TaskResult<TaskStatusView> {
        Ok(TaskStatusView::from_record(&self.store.read(name)?, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artillery_core::{CommandBuilder, DueState, LockInfo, OptionSet, TaskDraft};
    use artillery_storage::InMemoryTaskStore;
    use chrono::{Duration, TimeZone};

    fn add(store: &InMemoryTaskStore, name: &str, interval: u32) -> TaskName {
        let name = TaskName::parse(name).unwrap();
        store.create(TaskDraft::new(name.clone(), vec!["https://a".into()], interval, OptionSet::default())).unwrap();
        name
    }

    #[test]
    fn snapshot_reports_each_state() {
        let store = InMemoryTaskStore::new(CommandBuilder::new("gallery-dl", vec![], "/l"));
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let fresh = add(&store, "a_fresh", 10);
        let waiting = add(&store, "b_waiting", 60);
        let paused = add(&store, "c_paused", 10);
        let manual = add(&store, "d_manual", 0);
        let running = add(&store, "e_running", 10);
        store.touch_last_run(&waiting, now - Duration::minutes(15)).unwrap();
        store.set_paused(&paused, true).unwrap();
        store.try_lock(&running, &LockInfo::new(now)).unwrap();

        let snap = StatusService::new(&store).snapshot(now).unwrap();
        let states: Vec<DueState> = snap.tasks.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![
                DueState::Due,
                DueState::Waiting { next_due: now + Duration::minutes(45) },
                DueState::Paused,
                DueState::Idle,
                DueState::Running,
            ]
        );
        let due: Vec<&TaskName> = snap.due().map(|t| &t.name).collect();
        assert_eq!(due, vec![&fresh]);
        assert_eq!(StatusService::new(&store).task(&manual, now).unwrap().next_due, None);
    }
}
