use std::fmt;
use std::path::Path;

use crate::Config;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl fmt::Display for DoctorCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.ok { "ok" } else { "FAIL" };
        write!(f, "[{mark}] {}: {}", self.name, self.detail)
    }
}

/// Environment checks for the operator. Never mutates anything.
pub fn doctor(cfg: &Config) -> Vec<DoctorCheck> {
    vec![
        writable_dir("tasks_dir", &cfg.tasks_dir()),
        writable_dir("ledger_dir", &cfg.ledger_dir()),
        program_on_path(&cfg.downloader.program),
    ]
}

pub fn all_ok(checks: &[DoctorCheck]) -> bool {
    checks.iter().all(|c| c.ok)
}

fn writable_dir(name: &str, dir: &Path) -> DoctorCheck {
    let (ok, detail) = if !dir.is_dir() {
        (false, format!("{} does not exist; run `artillery init`", dir.display()))
    } else {
        match tempfile::tempfile_in(dir) {
            Ok(_) => (true, format!("{} is writable", dir.display())),
            Err(e) => (false, format!("{} is not writable: {e}", dir.display())),
        }
    };
    DoctorCheck { name: name.to_string(), ok, detail }
}

fn program_on_path(program: &str) -> DoctorCheck {
    let (ok, detail) = match which::which(program) {
        Ok(path) => (true, format!("{program} resolves to {}", path.display())),
        Err(e) => (false, format!("{program} not found: {e}")),
    };
    DoctorCheck { name: "downloader".to_string(), ok, detail }
}
