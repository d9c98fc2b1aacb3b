use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use artillery_core::{CommandBuilder, StaleLockPolicy};

pub const CONFIG_ENV: &str = "ARTILLERY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "~/.artillery/artillery.toml";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub paths: PathsConfig,
    pub downloader: DownloaderConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathsConfig {
    pub tasks_dir: String,
    pub ledger_dir: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloaderConfig {
    pub program: String,
    #[serde(default = "default_base_args")]
    pub base_args: Vec<String>,
    /// Extra environment for every download.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    /// Age after which a lock marker without a pid is treated as left
    /// behind by a crash. Markers with a pid are reclaimed once that process
    /// is gone. 0 disables reclaiming.
    #[serde(default = "default_stale_lock_minutes")]
    pub stale_lock_minutes: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_seconds: default_tick_seconds(), stale_lock_minutes: default_stale_lock_minutes() }
    }
}

fn default_base_args() -> Vec<String> {
    ["-f", "/O", "--no-input", "--verbose", "--no-part"].iter().map(|s| s.to_string()).collect()
}

fn default_tick_seconds() -> u64 {
    60
}

fn default_stale_lock_minutes() -> u32 {
    720
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig {
                tasks_dir: "~/.artillery/tasks".to_string(),
                ledger_dir: "~/.artillery/ledgers".to_string(),
            },
            downloader: DownloaderConfig {
                program: "gallery-dl".to_string(),
                base_args: default_base_args(),
                env: BTreeMap::new(),
            },
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// `--config`, then `$ARTILLERY_CONFIG`, then the per-user default.
    pub fn config_path(explicit: Option<&Path>) -> PathBuf {
        resolve_config_path(explicit, std::env::var(CONFIG_ENV).ok())
    }

    pub fn tasks_dir(&self) -> PathBuf {
        expand(&self.paths.tasks_dir)
    }

    pub fn ledger_dir(&self) -> PathBuf {
        expand(&self.paths.ledger_dir)
    }

    pub fn command_builder(&self) -> CommandBuilder {
        CommandBuilder::new(self.downloader.program.clone(), self.downloader.base_args.clone(), self.ledger_dir())
    }

    pub fn stale_lock_policy(&self) -> StaleLockPolicy {
        StaleLockPolicy::after_minutes(self.scheduler.stale_lock_minutes)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_seconds.max(1))
    }
}

fn resolve_config_path(explicit: Option<&Path>, env: Option<String>) -> PathBuf {
    if let Some(p) = explicit {
        return expand(&p.to_string_lossy());
    }
    match env.filter(|v| !v.trim().is_empty()) {
        Some(v) => expand(&v),
        None => expand(DEFAULT_CONFIG_PATH),
    }
}

fn expand(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).into_owned())
}
