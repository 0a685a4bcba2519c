use super::cgroup::{CgroupRoot, CgroupScope};
use super::confine;
use super::output::{read_bounded, BoundedBuffer};
use super::{CancelToken, PhaseSpec, PhaseOutput, SandboxError, SandboxInvoker};
use arena_common::config::EngineConfig;
use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{Gid, Pid, Uid};
use std::os::fd::BorrowedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long to wait for the output readers once the process group is dead.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub isolate_network: bool,
    /// Delegated cgroup v2 directory; enables the CPU share, memory and
    /// process caps.
    pub cgroup_root: Option<PathBuf>,
    /// Start even when some isolation cannot be enforced.
    pub allow_unconfined: bool,
}

impl ProcessOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            isolate_network: config.isolate_network,
            cgroup_root: config.cgroup_root.clone(),
            allow_unconfined: config.allow_unconfined_process,
        }
    }
}

/// Bare-process adapter.
///
/// The child gets its own session, rlimits for memory/fds/file size/CPU
/// time, `no_new_privs`, a fresh network namespace and, when the worker
/// runs as root, the unprivileged sandbox user. Landlock leaves its job
/// directory as the only writable tree and hides every other job. With a
/// cgroup root configured each phase also runs in its own cgroup carrying
/// the CPU share, memory and process caps.
pub struct ProcessSandbox {
    isolate_network: bool,
    landlock: bool,
    cgroups: Option<CgroupRoot>,
}

impl ProcessSandbox {
    /// Refuses to build when an isolation layer is missing, unless
    /// `allow_unconfined` is set.
    pub fn new(options: ProcessOptions) -> Result<Self, SandboxError> {
        let landlock = confine::supported();
        let cgroups = options.cgroup_root.map(CgroupRoot::open).transpose()?;

        let mut missing = Vec::new();
        if !landlock {
            missing.push("filesystem confinement (kernel lacks Landlock)");
        }
        if cgroups.is_none() {
            missing.push("CPU share and process cap (ARENA_CGROUP_ROOT not set)");
        }
        if !missing.is_empty() {
            if !options.allow_unconfined {
                return Err(SandboxError::Unconfined(missing.join(", ")));
            }
            warn!(missing = %missing.join(", "), "Process sandbox running with reduced isolation");
        }
        info!(landlock, cgroups = cgroups.is_some(), "Process sandbox ready");

        Ok(Self {
            isolate_network: options.isolate_network,
            landlock,
            cgroups,
        })
    }
}

/// Kills the whole process group on drop, catching stragglers and panics.
struct ProcessGroupGuard(Option<i32>);

impl ProcessGroupGuard {
    fn kill(&self) {
        if let Some(pgid) = self.0 {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Debug)]
enum Ending {
    Exited(std::process::ExitStatus),
    TimedOut,
    OutputLimit,
    Cancelled,
}

fn exit_code(status: std::process::ExitStatus) -> i64 {
    match status.code() {
        Some(code) => code as i64,
        None => 128 + status.signal().unwrap_or(0) as i64,
    }
}

async fn collect(handle: tokio::task::JoinHandle<BoundedBuffer>, cap: usize) -> BoundedBuffer {
    let abort = handle.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(buffer)) => buffer,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            BoundedBuffer::new(cap)
        }
        Err(_) => {
            abort.abort();
            warn!("Output reader did not finish after kill, discarding");
            BoundedBuffer::new(cap)
        }
    }
}

#[async_trait]
impl SandboxInvoker for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    fn mount_point(&self, host_dir: &Path) -> PathBuf {
        host_dir.to_path_buf()
    }

    fn runs_as_worker(&self) -> bool {
        !Uid::effective().is_root()
    }

    #[tracing::instrument(skip_all, fields(job_id = %spec.job_id, phase = %spec.phase))]
    async fn run(
        &self,
        spec: &PhaseSpec,
        cancel: &mut CancelToken,
    ) -> Result<PhaseOutput, SandboxError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| SandboxError::Launch("empty command line".to_string()))?;

        let stdin = match &spec.stdin {
            Some(path) => Stdio::from(std::fs::File::open(path)?),
            None => Stdio::null(),
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &spec.host_dir)
            .env("LANG", "C.UTF-8")
            .env("TMPDIR", &spec.host_dir)
            .current_dir(&spec.host_dir)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let limits = spec.limits.clone();
        let memory_bytes = limits.memory_mb as u64 * 1024 * 1024;
        let cpu_seconds = limits.timeout.as_secs() + 1;
        let (uid, gid) = spec.user;
        let drop_privileges = Uid::effective().is_root();
        let isolate_network = self.isolate_network;

        let scope = match &self.cgroups {
            Some(root) => {
                let name = format!("{}-{}", spec.job_id.simple(), spec.phase);
                Some(root.scope(&name, &spec.limits)?)
            }
            None => None,
        };
        let cgroup_procs = scope.as_ref().and_then(CgroupScope::procs_fd);
        let ruleset = if self.landlock {
            Some(confine::job_ruleset(&spec.host_dir)?)
        } else {
            None
        };
        let ruleset = Mutex::new(ruleset);

        // Runs in the forked child before exec: only async-signal-safe syscalls.
        unsafe {
            command.pre_exec(move || {
                let os = |e: nix::errno::Errno| std::io::Error::from_raw_os_error(e as i32);

                nix::unistd::setsid().map_err(os)?;
                if let Some(fd) = cgroup_procs {
                    nix::unistd::write(BorrowedFd::borrow_raw(fd), b"0").map_err(os)?;
                }

                setrlimit(Resource::RLIMIT_DATA, memory_bytes, memory_bytes).map_err(os)?;
                setrlimit(Resource::RLIMIT_NOFILE, limits.nofile as u64, limits.nofile as u64)
                    .map_err(os)?;
                setrlimit(Resource::RLIMIT_FSIZE, limits.fsize_bytes, limits.fsize_bytes)
                    .map_err(os)?;
                setrlimit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds).map_err(os)?;
                setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(os)?;

                if isolate_network {
                    let flags = if drop_privileges {
                        nix::sched::CloneFlags::CLONE_NEWNET
                    } else {
                        nix::sched::CloneFlags::CLONE_NEWUSER | nix::sched::CloneFlags::CLONE_NEWNET
                    };
                    nix::sched::unshare(flags).map_err(os)?;
                }

                if drop_privileges {
                    setrlimit(Resource::RLIMIT_NPROC, limits.pids as u64, limits.pids as u64)
                        .map_err(os)?;
                    nix::unistd::setgroups(&[]).map_err(os)?;
                    nix::unistd::setgid(Gid::from_raw(gid)).map_err(os)?;
                    nix::unistd::setuid(Uid::from_raw(uid)).map_err(os)?;
                }

                nix::sys::prctl::set_no_new_privs().map_err(os)?;

                let pending = match ruleset.lock() {
                    Ok(mut slot) => slot.take(),
                    Err(_) => return Err(std::io::ErrorKind::PermissionDenied.into()),
                };
                if let Some(ruleset) = pending {
                    ruleset
                        .restrict_self()
                        .map_err(|_| std::io::Error::from(std::io::ErrorKind::PermissionDenied))?;
                }
                Ok(())
            });
        }

        let start = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Launch(format!("{}: {}", program, e)))?;
        let group = ProcessGroupGuard(child.id().map(|pid| pid as i32));

        let cap = spec.limits.output_bytes;
        let overflow = Arc::new(Notify::new());
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Launch("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Launch("stderr not captured".to_string()))?;
        let stdout_task = tokio::spawn(read_bounded(stdout, cap, overflow.clone()));
        let stderr_task = tokio::spawn(read_bounded(stderr, cap, overflow.clone()));

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status?),
            _ = tokio::time::sleep(spec.limits.timeout) => Ending::TimedOut,
            _ = overflow.notified() => Ending::OutputLimit,
            _ = cancel.cancelled() => Ending::Cancelled,
        };
        let wall_ms = start.elapsed().as_millis() as u64;

        // Unconditional: also reaps anything the program left running.
        group.kill();
        let status = match ending {
            Ending::Exited(status) => status,
            _ => {
                debug!(?ending, "Killing process group");
                child.start_kill().ok();
                child.wait().await?
            }
        };

        let stdout = collect(stdout_task, cap).await;
        let stderr = collect(stderr_task, cap).await;
        let output_limit_exceeded =
            matches!(ending, Ending::OutputLimit) || stdout.is_truncated() || stderr.is_truncated();
        let oom_killed = scope.as_ref().is_some_and(CgroupScope::oom_killed);
        if let Some(scope) = scope {
            // Removal polls until the killed members are gone.
            tokio::task::spawn_blocking(move || drop(scope));
        }

        Ok(PhaseOutput {
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            exit_code: Some(exit_code(status)),
            timed_out: matches!(ending, Ending::TimedOut),
            output_limit_exceeded,
            cancelled: matches!(ending, Ending::Cancelled),
            oom_killed,
            wall_ms,
        })
    }
}
