use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use artillery_core::{
    format_timestamp, now, InputMode, OptionSet, TaskDraft, TaskError, TaskName, TaskPatch, TaskRecord,
    TaskStatusView,
};
use artillery_runner::{all_ok, Config, Runner};
use artillery_storage::TaskStore;

#[derive(Parser)]
#[command(name = "artillery", version)]
struct Cli {
    /// Config file (defaults to $ARTILLERY_CONFIG, then ~/.artillery/artillery.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config (if missing) and create data directories
    Init,

    /// Check directories and the downloader program
    Doctor,

    /// Show every task and when it runs next
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Create a recurring download task
    TaskAdd {
        #[arg(long)]
        name: String,
        /// Input line; repeatable
        #[arg(long = "url")]
        urls: Vec<String>,
        /// Read input lines from a file
        #[arg(long)]
        urls_file: Option<PathBuf>,
        /// Minutes between runs; 0 means manual only
        #[arg(long, default_value_t = 60)]
        interval: u32,
        #[command(flatten)]
        options: OptionArgs,
    },

    /// Change inputs, interval or options of a task
    TaskEdit {
        name: String,
        #[arg(long = "url")]
        urls: Vec<String>,
        #[arg(long)]
        urls_file: Option<PathBuf>,
        #[arg(long)]
        interval: Option<u32>,
        /// Drop every option before applying the ones given here
        #[arg(long)]
        clear_options: bool,
        #[command(flatten)]
        options: OptionArgs,
    },

    /// Print one task in full
    Show { name: String },

    Pause { name: String },

    Resume { name: String },

    /// Remove a task; its download archive is kept
    Delete { name: String },

    /// Remove only the download archive of a task
    DeleteArchive { name: String },

    /// Run a task now, regardless of its schedule
    Run { name: String },

    /// Clear a lock left behind by a crashed run
    Unlock { name: String },

    /// Print the task log
    Log {
        name: String,
        /// Only the last N lines
        #[arg(long)]
        tail: Option<usize>,
    },

    /// Run every due task once
    Tick,

    /// Tick forever (or N times)
    Watch {
        #[arg(long)]
        ticks: Option<u64>,
    },
}

#[derive(Args, Debug, Default)]
struct OptionArgs {
    /// Use `-I <filter> <first input>` instead of a list file
    #[arg(long)]
    filter: Option<String>,
    /// List file name inside the task directory
    #[arg(long)]
    list_file: Option<String>,
    #[arg(long)]
    write_unsupported: bool,
    #[arg(long)]
    no_skip: bool,
    #[arg(long)]
    write_metadata: bool,
    #[arg(long)]
    write_info_json: bool,
    #[arg(long)]
    write_tags: bool,
    #[arg(long)]
    retries: Option<String>,
    #[arg(long)]
    limit_rate: Option<String>,
    #[arg(long)]
    sleep: Option<String>,
    #[arg(long)]
    sleep_request: Option<String>,
    #[arg(long = "sleep-429")]
    sleep_429: Option<String>,
    #[arg(long)]
    sleep_extractor: Option<String>,
    #[arg(long)]
    rename: Option<String>,
    #[arg(long)]
    rename_to: Option<String>,
    /// Pass `-C cookies.txt` (place the file in the task directory)
    #[arg(long)]
    cookies: bool,
    /// Keep a dedup ledger so files are never fetched twice
    #[arg(long)]
    archive: bool,
    /// Turn a switch off again; repeatable, applied after the flags above
    #[arg(long = "off", value_enum)]
    off: Vec<Switch>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Switch {
    WriteUnsupported,
    NoSkip,
    WriteMetadata,
    WriteInfoJson,
    WriteTags,
    Cookies,
    Archive,
}

impl OptionArgs {
    fn any(&self) -> bool {
        let toggles = self.write_unsupported
            || self.no_skip
            || self.write_metadata
            || self.write_info_json
            || self.write_tags
            || self.cookies
            || self.archive
            || !self.off.is_empty();
        let values = [
            &self.filter,
            &self.list_file,
            &self.retries,
            &self.limit_rate,
            &self.sleep,
            &self.sleep_request,
            &self.sleep_429,
            &self.sleep_extractor,
            &self.rename,
            &self.rename_to,
        ];
        toggles || values.iter().any(|v| v.is_some())
    }

    /// Layers the given flags on top of `base`.
    fn apply(self, mut base: OptionSet) -> OptionSet {
        match (self.filter, self.list_file) {
            (Some(filter), _) => base.input = InputMode::FilterSingle { filter },
            (None, Some(file)) => base.input = InputMode::List { file },
            (None, None) => {}
        }
        let t = &mut base.toggles;
        t.write_unsupported |= self.write_unsupported;
        t.no_skip |= self.no_skip;
        t.write_metadata |= self.write_metadata;
        t.write_info_json |= self.write_info_json;
        t.write_tags |= self.write_tags;

        let v = &mut base.values;
        for (slot, value) in [
            (&mut v.retries, self.retries),
            (&mut v.limit_rate, self.limit_rate),
            (&mut v.sleep, self.sleep),
            (&mut v.sleep_request, self.sleep_request),
            (&mut v.sleep_429, self.sleep_429),
            (&mut v.sleep_extractor, self.sleep_extractor),
            (&mut v.rename, self.rename),
            (&mut v.rename_to, self.rename_to),
        ] {
            if value.is_some() {
                *slot = value;
            }
        }
        base.cookies |= self.cookies;
        base.download_archive |= self.archive;

        for switch in self.off {
            let slot = match switch {
                Switch::WriteUnsupported => &mut base.toggles.write_unsupported,
                Switch::NoSkip => &mut base.toggles.no_skip,
                Switch::WriteMetadata => &mut base.toggles.write_metadata,
                Switch::WriteInfoJson => &mut base.toggles.write_info_json,
                Switch::WriteTags => &mut base.toggles.write_tags,
                Switch::Cookies => &mut base.cookies,
                Switch::Archive => &mut base.download_archive,
            };
            *slot = false;
        }
        base
    }
}

fn read_inputs(urls: Vec<String>, urls_file: Option<PathBuf>) -> Result<Option<Vec<String>>> {
    let mut lines = urls;
    if let Some(path) = urls_file {
        let text = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        lines.push(text);
    }
    Ok(if lines.is_empty() { None } else { Some(lines) })
}

fn task_name(raw: &str) -> Result<TaskName> {
    Ok(TaskName::sanitize(raw)?)
}

fn print_view(v: &TaskStatusView) {
    let ts = |t: Option<chrono::DateTime<chrono::Utc>>| t.map(format_timestamp).unwrap_or_else(|| "-".into());
    println!(
        "{:<24} {:<8} {:>6}m  last {:<20}  next {:<20}{}",
        v.name.as_str(),
        v.state.label(),
        v.interval_minutes,
        ts(v.last_run_at),
        ts(v.next_due),
        if v.has_log { "  [log]" } else { "" }
    );
}

fn print_record(r: &TaskRecord, v: &TaskStatusView) {
    println!("name:      {} ({})", r.name, r.name.display_name());
    println!("state:     {}", v.state.label());
    println!("interval:  {} minutes", r.interval_minutes);
    println!(
        "last run:  {}",
        r.last_run_at.map(format_timestamp).unwrap_or_else(|| "never".into())
    );
    if let Some(next) = v.next_due {
        println!("next due:  {}", format_timestamp(next));
    }
    if let Some(lock) = &r.lock {
        println!("locked:    by {} (pid {}) since {}", lock.owner.as_str(), lock.pid, format_timestamp(lock.acquired_at));
    }
    println!("command:   {}", r.command_line);
    println!("inputs:");
    for line in &r.input_list {
        println!("  {line}");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config_path = Config::config_path(cli.config.as_deref());

    match cli.cmd {
        Command::Init => {
            let cfg = Runner::init(&config_path)?;
            println!("Config:  {}", config_path.display());
            println!("Tasks:   {}", cfg.tasks_dir().display());
            println!("Ledgers: {}", cfg.ledger_dir().display());
        }
        Command::Doctor => {
            let r = Runner::open(config_path)?;
            let checks = r.doctor();
            for c in &checks {
                println!("{c}");
            }
            if !all_ok(&checks) {
                bail!("doctor found problems");
            }
            println!("OK");
        }
        Command::Status { json } => {
            let r = Runner::open(config_path)?;
            let snap = r.status(now())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snap)?);
            } else {
                println!("Tasks: {}", snap.tasks.len());
                for t in &snap.tasks {
                    print_view(t);
                }
            }
        }
        Command::TaskAdd { name, urls, urls_file, interval, options } => {
            let r = Runner::open(config_path)?;
            let name = task_name(&name)?;
            let inputs = read_inputs(urls, urls_file)?.unwrap_or_default();
            let draft = TaskDraft::new(name, inputs, interval, options.apply(OptionSet::default()));
            let rec = r.store.create(draft)?;
            info!(task = %rec.name, "added");
            println!("Added task {}", rec.name);
            println!("  {}", rec.command_line);
        }
        Command::TaskEdit { name, urls, urls_file, interval, clear_options, options } => {
            let r = Runner::open(config_path)?;
            let name = task_name(&name)?;
            let current = r.store.read(&name)?;
            let options = if clear_options || options.any() {
                let base = if clear_options { OptionSet::default() } else { current.options.clone() };
                Some(options.apply(base))
            } else {
                None
            };
            let patch = TaskPatch { input_list: read_inputs(urls, urls_file)?, interval_minutes: interval, options };
            if patch.is_empty() {
                bail!("nothing to change; pass --url, --interval or option flags");
            }
            let rec = r.store.update(&name, patch)?;
            println!("Updated task {}", rec.name);
            println!("  {}", rec.command_line);
        }
        Command::Show { name } => {
            let r = Runner::open(config_path)?;
            let rec = r.store.read(&task_name(&name)?)?;
            print_record(&rec, &TaskStatusView::from_record(&rec, now()));
        }
        Command::Pause { name } => {
            let r = Runner::open(config_path)?;
            r.store.set_paused(&task_name(&name)?, true)?;
            println!("Paused {name}");
        }
        Command::Resume { name } => {
            let r = Runner::open(config_path)?;
            r.store.set_paused(&task_name(&name)?, false)?;
            println!("Resumed {name}");
        }
        Command::Delete { name } => {
            let r = Runner::open(config_path)?;
            match r.store.delete(&task_name(&name)?) {
                Ok(()) => println!("Deleted {name}"),
                Err(TaskError::NotFound { .. }) => println!("{name} does not exist"),
                Err(e) => return Err(e.into()),
            }
        }
        Command::DeleteArchive { name } => {
            let r = Runner::open(config_path)?;
            if r.store.delete_archive(&task_name(&name)?)? {
                println!("Deleted download archive of {name}");
            } else {
                println!("{name} has no download archive");
            }
        }
        Command::Run { name } => {
            let r = Runner::open(config_path)?;
            let outcome = r.guard().execute(&task_name(&name)?)?;
            print!("{}", outcome.output);
            println!("{name}: {}", outcome.summary());
            if !outcome.succeeded() {
                std::process::exit(1);
            }
        }
        Command::Unlock { name } => {
            let r = Runner::open(config_path)?;
            if r.unlock(&task_name(&name)?)? {
                println!("Cleared lock on {name}");
            } else {
                println!("{name} is not locked");
            }
        }
        Command::Log { name, tail } => {
            let r = Runner::open(config_path)?;
            let Some(log) = r.store.read_log(&task_name(&name)?)? else {
                println!("{name} has not run yet");
                return Ok(());
            };
            let lines: Vec<&str> = log.lines().collect();
            let skip = tail.map_or(0, |n| lines.len().saturating_sub(n));
            for line in &lines[skip..] {
                println!("{line}");
            }
        }
        Command::Tick => {
            let r = Runner::open(config_path)?;
            let report = r.run_due(now())?;
            for o in &report.ran {
                println!("{}: {}", o.task, o.summary());
            }
            for n in &report.busy {
                println!("{n}: already running");
            }
            for (n, e) in &report.errors {
                println!("{n}: {e}");
            }
            if report.ran.is_empty() && report.busy.is_empty() && report.errors.is_empty() {
                println!("Nothing due");
            }
        }
        Command::Watch { ticks } => {
            let r = Runner::open(config_path)?;
            let every = r.cfg.tick_interval();
            info!(seconds = every.as_secs(), "watching");
            let mut done = 0u64;
            loop {
                let report = r.run_due(now())?;
                if !report.ran.is_empty() {
                    info!(ran = report.ran.len(), busy = report.busy.len(), "tick");
                }
                done += 1;
                if ticks.is_some_and(|n| done >= n) {
                    break;
                }
                std::thread::sleep(every);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use artillery_core::{Toggles, ValuedOptions};

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn task_add_flags_map_to_options() {
        let cli = Cli::parse_from([
            "artillery",
            "task-add",
            "--name",
            "My Feed",
            "--url",
            "https://example.com/a",
            "--interval",
            "15",
            "--filter",
            "extension in ('jpg',)",
            "--write-tags",
            "--sleep-429",
            "30",
            "--archive",
        ]);
        let Command::TaskAdd { name, urls, interval, options, .. } = cli.cmd else {
            panic!("wrong subcommand");
        };
        assert_eq!(task_name(&name).unwrap().as_str(), "My_Feed");
        assert_eq!(urls, vec!["https://example.com/a"]);
        assert_eq!(interval, 15);
        let opts = options.apply(OptionSet::default());
        assert_eq!(opts.input, InputMode::FilterSingle { filter: "extension in ('jpg',)".into() });
        assert!(opts.toggles.write_tags);
        assert_eq!(opts.values.sleep_429.as_deref(), Some("30"));
        assert!(opts.download_archive);
        assert!(!opts.cookies);
    }

    #[test]
    fn edit_layers_flags_over_current_options() {
        let current = OptionSet {
            toggles: Toggles { no_skip: true, ..Toggles::default() },
            values: ValuedOptions { retries: Some("3".into()), ..ValuedOptions::default() },
            ..OptionSet::default()
        };
        let args = OptionArgs { list_file: Some("links.txt".into()), sleep: Some("2".into()), ..OptionArgs::default() };
        assert!(args.any());
        let merged = args.apply(current);
        assert!(merged.toggles.no_skip);
        assert_eq!(merged.values.retries.as_deref(), Some("3"));
        assert_eq!(merged.values.sleep.as_deref(), Some("2"));
        assert_eq!(merged.input, InputMode::List { file: "links.txt".into() });
        assert!(!OptionArgs::default().any());
    }

    #[test]
    fn edit_can_switch_options_off() {
        let cli = Cli::parse_from([
            "artillery",
            "task-edit",
            "feed",
            "--off",
            "no-skip",
            "--off",
            "cookies",
            "--write-tags",
        ]);
        let Command::TaskEdit { options, .. } = cli.cmd else {
            panic!("wrong subcommand");
        };
        assert!(options.any());
        let current = OptionSet {
            toggles: Toggles { no_skip: true, write_metadata: true, ..Toggles::default() },
            cookies: true,
            ..OptionSet::default()
        };
        let merged = options.apply(current);
        assert!(!merged.toggles.no_skip);
        assert!(!merged.cookies);
        assert!(merged.toggles.write_metadata);
        assert!(merged.toggles.write_tags);
    }
}
