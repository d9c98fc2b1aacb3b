use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use artillery_core::{
    CommandBuilder, InputMode, LockInfo, OptionSet, TaskDraft, TaskError, TaskName, TaskPatch, Toggles,
};
use artillery_storage::TaskStore;
use artillery_storage_fs::{FsTaskStore, COMMAND_FILE, INTERVAL_FILE, LAST_RUN_FILE, OPTIONS_FILE};
use chrono::{Duration, TimeZone, Utc};
use tempfile::tempdir;

fn open(root: &Path) -> FsTaskStore {
    let builder = CommandBuilder::new(
        "gallery-dl",
        vec!["-f".into(), "/O".into(), "--no-input".into(), "--verbose".into(), "--no-part".into()],
        root.join("ledgers"),
    );
    FsTaskStore::open(root.join("tasks"), builder).unwrap()
}

fn name(s: &str) -> TaskName {
    TaskName::parse(s).unwrap()
}

fn draft(n: &str, interval: u32) -> TaskDraft {
    TaskDraft::new(name(n), vec!["https://example.com/gallery".into()], interval, OptionSet::default())
}

#[test]
fn create_twice_keeps_the_first_definition() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    store.create(draft("task_1", 30)).unwrap();
    let err = store.create(draft("task_1", 5)).unwrap_err();
    assert!(matches!(err, TaskError::AlreadyExists { .. }));
    assert_eq!(store.read(&name("task_1")).unwrap().interval_minutes, 30);
}

#[test]
fn invalid_draft_writes_nothing() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let mut d = draft("bad", 10);
    d.options.input = InputMode::FilterSingle { filter: "".into() };
    assert!(store.create(d).unwrap_err().is_validation());
    assert!(!store.workdir(&name("bad")).exists());
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn list_skips_junk_and_sorts() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    store.create(draft("zeta", 10)).unwrap();
    store.create(draft("alpha", 10)).unwrap();

    let tasks = store.root().to_path_buf();
    fs::create_dir(tasks.join(".trash")).unwrap();
    fs::create_dir(tasks.join("not a task")).unwrap();
    fs::create_dir(tasks.join("empty_dir")).unwrap();
    fs::write(tasks.join("stray.txt"), "x").unwrap();
    // loadable-looking but broken options
    fs::create_dir(tasks.join("broken")).unwrap();
    fs::write(tasks.join("broken").join(INTERVAL_FILE), "5").unwrap();
    fs::write(tasks.join("broken").join(OPTIONS_FILE), "{not json").unwrap();

    let names: Vec<String> = store.list().unwrap().into_iter().map(|r| r.name.to_string()).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
    assert!(matches!(store.read(&name("broken")), Err(TaskError::Corrupt { .. })));
}

#[test]
fn legacy_record_without_options_loads_from_command() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let task = store.root().join("Old_Task");
    fs::create_dir(&task).unwrap();
    fs::write(task.join("url_list.txt"), "https://example.com/a\n\nhttps://example.com/b\n").unwrap();
    fs::write(task.join(INTERVAL_FILE), "60\n").unwrap();
    fs::write(
        task.join(COMMAND_FILE),
        "gallery-dl -f /O --no-input --verbose --no-part -i url_list.txt --write-tags --retries 4 -C cookies.txt",
    )
    .unwrap();
    fs::write(task.join(LAST_RUN_FILE), "2024-05-01 12:00:00").unwrap();

    let rec = store.read(&name("Old_Task")).unwrap();
    assert_eq!(rec.interval_minutes, 60);
    assert_eq!(rec.input_list.len(), 2);
    assert!(rec.options.toggles.write_tags);
    assert!(rec.options.cookies);
    assert_eq!(rec.options.values.retries.as_deref(), Some("4"));
    assert_eq!(rec.last_run_at, Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
    assert_eq!(rec.name.display_name(), "Old Task");
}

#[test]
fn update_rewrites_command_and_keeps_run_state() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let n = store.create(draft("t", 10)).unwrap().name;
    let ran = Utc.with_ymd_and_hms(2024, 2, 2, 2, 2, 2).unwrap();
    store.touch_last_run(&n, ran).unwrap();
    store.set_paused(&n, true).unwrap();
    store.append_log(&n, "first run\n").unwrap();

    let options = OptionSet {
        toggles: Toggles { no_skip: true, ..Toggles::default() },
        download_archive: true,
        ..OptionSet::default()
    };
    let patch = TaskPatch { interval_minutes: Some(45), options: Some(options), ..TaskPatch::default() };
    let rec = store.update(&n, patch).unwrap();

    assert_eq!(rec.interval_minutes, 45);
    assert_eq!(rec.last_run_at, Some(ran));
    assert!(rec.paused);
    assert_eq!(store.read_log(&n).unwrap().as_deref(), Some("first run\n"));
    let ledger = store.builder().ledger_path(&n);
    let expected = format!(
        "gallery-dl -f /O --no-input --verbose --no-part -i url_list.txt --no-skip --download-archive {}",
        ledger.display()
    );
    assert_eq!(rec.command_line.to_string(), expected);
    assert_eq!(fs::read_to_string(store.workdir(&n).join(COMMAND_FILE)).unwrap(), expected);
}

#[test]
fn invalid_update_leaves_record_untouched() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let n = store.create(draft("t", 10)).unwrap().name;
    let before = store.read(&n).unwrap();
    let patch = TaskPatch { input_list: Some(vec!["   ".into()]), ..TaskPatch::default() };
    assert!(store.update(&n, patch).unwrap_err().is_validation());
    assert_eq!(store.read(&n).unwrap(), before);
}

#[test]
fn last_run_never_moves_backwards() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let n = store.create(draft("t", 10)).unwrap().name;
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    store.touch_last_run(&n, now).unwrap();
    store.touch_last_run(&n, now - Duration::hours(1)).unwrap();
    assert_eq!(store.read(&n).unwrap().last_run_at, Some(now));
    store.touch_last_run(&n, now + Duration::minutes(1)).unwrap();
    assert_eq!(store.read(&n).unwrap().last_run_at, Some(now + Duration::minutes(1)));
}

#[test]
fn pause_and_resume() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let n = store.create(draft("t", 10)).unwrap().name;
    store.set_paused(&n, true).unwrap();
    assert!(store.read(&n).unwrap().paused);
    store.set_paused(&n, false).unwrap();
    store.set_paused(&n, false).unwrap();
    assert!(!store.read(&n).unwrap().paused);
    assert!(store.set_paused(&name("missing"), true).unwrap_err().is_not_found());
}

#[test]
fn delete_keeps_ledger_and_delete_archive_removes_it() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let n = store.create(draft("t", 10)).unwrap().name;
    let ledger = store.builder().ledger_path(&n);
    fs::write(&ledger, "sqlite bytes").unwrap();

    store.delete(&n).unwrap();
    assert!(!store.workdir(&n).exists());
    assert!(ledger.exists());
    assert!(store.read(&n).unwrap_err().is_not_found());
    assert!(store.delete(&n).unwrap_err().is_not_found());

    assert!(store.delete_archive(&n).unwrap());
    assert!(!ledger.exists());
    assert!(!store.delete_archive(&n).unwrap());
}

#[test]
fn delete_refused_while_locked() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let n = store.create(draft("t", 10)).unwrap().name;
    let lock = LockInfo::new(Utc::now());
    assert!(store.try_lock(&n, &lock).unwrap());
    assert!(matches!(store.delete(&n), Err(TaskError::AlreadyRunning { .. })));
    store.release_lock(&n, &lock.owner).unwrap();
    store.delete(&n).unwrap();
}

#[test]
fn only_one_thread_wins_the_lock() {
    let dir = tempdir().unwrap();
    let store = Arc::new(open(dir.path()));
    let n = store.create(draft("t", 10)).unwrap().name;
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            let n = n.clone();
            thread::spawn(move || {
                barrier.wait();
                store.try_lock(&n, &LockInfo::new(Utc::now())).unwrap()
            })
        })
        .collect();
    let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
    assert_eq!(winners, 1);
    assert!(store.read(&n).unwrap().locked());
}
