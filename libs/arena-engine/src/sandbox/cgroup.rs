// Per-phase cgroup v2 scopes for the process adapter.
// The worker needs a delegated subtree with the cpu, memory and pids
// controllers enabled in its cgroup.subtree_control.

use super::{PhaseLimits, SandboxError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::warn;

const CPU_PERIOD_US: u64 = 100_000;
const REQUIRED_CONTROLLERS: [&str; 3] = ["cpu", "memory", "pids"];

fn cgroup_error(path: &Path, what: &str, e: std::io::Error) -> SandboxError {
    SandboxError::Launch(format!("cgroup {}: {}: {}", path.display(), what, e))
}

/// Delegated cgroup directory that job scopes are created under.
#[derive(Debug, Clone)]
pub struct CgroupRoot {
    path: PathBuf,
}

impl CgroupRoot {
    /// Check that `path` is a cgroup v2 directory handing the needed
    /// controllers down to its children.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let path = path.into();
        let controllers = fs::read_to_string(path.join("cgroup.subtree_control"))
            .map_err(|e| cgroup_error(&path, "read cgroup.subtree_control", e))?;
        let enabled: Vec<&str> = controllers.split_whitespace().collect();
        if let Some(missing) = REQUIRED_CONTROLLERS.iter().find(|c| !enabled.contains(c)) {
            return Err(SandboxError::Unconfined(format!(
                "controller '{}' is not enabled in {}/cgroup.subtree_control",
                missing,
                path.display()
            )));
        }
        Ok(Self { path })
    }

    /// Create a scope named `name` carrying `limits`.
    pub fn scope(&self, name: &str, limits: &PhaseLimits) -> Result<CgroupScope, SandboxError> {
        let path = self.path.join(name);
        fs::create_dir(&path).map_err(|e| cgroup_error(&path, "create", e))?;
        // From here on the directory is removed on every exit path.
        let mut scope = CgroupScope { path, procs: None };

        let memory_bytes = limits.memory_mb as u64 * 1024 * 1024;
        scope.write("memory.max", &memory_bytes.to_string())?;
        if scope.path.join("memory.swap.max").exists() {
            scope.write("memory.swap.max", "0")?;
        }
        scope.write("pids.max", &limits.pids.to_string())?;
        scope.write("cpu.max", &cpu_max(limits.cpu))?;

        let procs_path = scope.path.join("cgroup.procs");
        let procs = OpenOptions::new()
            .write(true)
            .open(&procs_path)
            .map_err(|e| cgroup_error(&procs_path, "open", e))?;
        scope.procs = Some(procs);
        Ok(scope)
    }
}

/// `cpu.max` line for a share of one CPU.
fn cpu_max(cpu: f32) -> String {
    let quota = ((cpu as f64) * CPU_PERIOD_US as f64).round().max(1000.0) as u64;
    format!("{} {}", quota, CPU_PERIOD_US)
}

/// One phase's cgroup. Dropping it kills what is left inside and removes it.
#[derive(Debug)]
pub struct CgroupScope {
    path: PathBuf,
    procs: Option<File>,
}

impl CgroupScope {
    fn write(&self, file: &str, value: &str) -> Result<(), SandboxError> {
        let target = self.path.join(file);
        fs::write(&target, value).map_err(|e| cgroup_error(&target, "write", e))
    }

    /// Descriptor of `cgroup.procs`; a child writing "0" to it joins the scope.
    pub fn procs_fd(&self) -> Option<RawFd> {
        self.procs.as_ref().map(|f| f.as_raw_fd())
    }

    /// Whether the kernel OOM-killed anything in the scope.
    pub fn oom_killed(&self) -> bool {
        fs::read_to_string(self.path.join("memory.events"))
            .map(|events| parse_oom_kills(&events) > 0)
            .unwrap_or(false)
    }

    /// SIGKILL every member.
    pub fn kill(&self) {
        if fs::write(self.path.join("cgroup.kill"), "1").is_ok() {
            return;
        }
        // cgroup.kill needs 5.14; fall back to walking the member list.
        if let Ok(procs) = fs::read_to_string(self.path.join("cgroup.procs")) {
            for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }
}

impl Drop for CgroupScope {
    fn drop(&mut self) {
        self.procs.take();
        self.kill();
        // Killed members linger briefly before the directory can go.
        for _ in 0..50 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(10)),
            }
        }
        warn!(path = %self.path.display(), "Failed to remove cgroup scope");
    }
}

fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
