use std::path::PathBuf;

use artillery_core::{LockInfo, LockOwner, TaskDraft, TaskName, TaskPatch, TaskRecord, TaskResult};
use chrono::{DateTime, Utc};

/// Durable task records. Every mutation touches a single field so callers
/// never need a cross-field transaction; readers may run concurrently.
pub trait TaskStore: Send + Sync {
    /// Fails with `AlreadyExists` rather than overwriting.
    fn create(&self, draft: TaskDraft) -> TaskResult<TaskRecord>;
    fn read(&self, name: &TaskName) -> TaskResult<TaskRecord>;
    /// All loadable records sorted by name; junk entries are skipped.
    fn list(&self) -> TaskResult<Vec<TaskRecord>>;
    /// Replaces the definition and regenerates the command line.
    fn update(&self, name: &TaskName, patch: TaskPatch) -> TaskResult<TaskRecord>;

    fn set_paused(&self, name: &TaskName, paused: bool) -> TaskResult<()>;
    /// Ignored when `at` is older than the stored value.
    fn touch_last_run(&self, name: &TaskName, at: DateTime<Utc>) -> TaskResult<()>;
    fn append_log(&self, name: &TaskName, text: &str) -> TaskResult<()>;
    fn read_log(&self, name: &TaskName) -> TaskResult<Option<String>>;

    /// Removes the whole record, refusing while the lock marker exists.
    /// Never touches the dedup ledger.
    fn delete(&self, name: &TaskName) -> TaskResult<()>;
    /// Removes only the dedup ledger. Returns whether one existed.
    fn delete_archive(&self, name: &TaskName) -> TaskResult<bool>;

    /// Atomic create-if-absent of the lock marker. `Ok(false)` when held.
    fn try_lock(&self, name: &TaskName, lock: &LockInfo) -> TaskResult<bool>;
    /// Removes the marker only if it still holds exactly `expected`.
    fn break_lock(&self, name: &TaskName, expected: &LockInfo) -> TaskResult<bool>;
    /// Removes the marker if `owner` holds it; a missing marker is fine.
    fn release_lock(&self, name: &TaskName, owner: &LockOwner) -> TaskResult<()>;

    /// Working directory for the downloader.
    fn workdir(&self, name: &TaskName) -> PathBuf;
}
