use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

/// What a finished child left behind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// stdout followed by stderr, decoded lossily.
    pub output: String,
    /// `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one argv to completion. `Err` means the program could not be
/// started at all; a non-zero exit is a normal `Ok`.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, argv: &[String], cwd: &Path) -> io::Result<ProcessOutput>;
}

#[derive(Clone, Debug, Default)]
pub struct SystemProcessRunner {
    env: BTreeMap<String, String>,
}

impl SystemProcessRunner {
    pub fn new(env: BTreeMap<String, String>) -> Self {
        Self { env }
    }
}

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, argv: &[String], cwd: &Path) -> io::Result<ProcessOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
        let out = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .envs(&self.env)
            .stdin(Stdio::null())
            .output()?;

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(ProcessOutput { output, exit_code: out.status.code() })
    }
}

/// Whether `pid` names a process on this host. Signal 0 probes without
/// delivering anything; `EPERM` still means the process exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a way to probe, every recorded holder counts as alive.
#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    pid != 0
}
