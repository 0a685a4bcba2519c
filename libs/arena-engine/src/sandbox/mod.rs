/// Sandbox Invoker - one isolated execution unit per phase
///
/// **Contract:**
/// Given an argv, a job directory and limits, run to completion or until
/// the wall clock expires, and hand back bounded stdout/stderr plus how
/// the run ended.
///
/// **Adapters:**
/// - `DockerSandbox`: locked-down container (canonical)
/// - `ProcessSandbox`: rlimited subprocess in its own session, Landlock
///   confined to its job directory, optionally inside a cgroup v2 scope
///
/// Both enforce the same `PhaseSpec`; the executor never knows which one runs.
pub mod cgroup;
pub mod confine;
pub mod docker;
pub mod output;
pub mod process;

pub use docker::DockerSandbox;
pub use process::{ProcessOptions, ProcessSandbox};

use arena_common::config::{EngineConfig, SandboxKind};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Failures of the sandbox machinery itself. The user's program failing is
/// never a `SandboxError`; it is a `PhaseOutput` with a non-zero exit.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to launch sandbox: {0}")]
    Launch(String),

    #[error("sandbox image '{image}' unavailable: {reason}")]
    Image { image: String, reason: String },

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox cannot enforce {0}")]
    Unconfined(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Run,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Compile => f.write_str("compile"),
            Phase::Run => f.write_str("run"),
        }
    }
}

/// Ceilings for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseLimits {
    pub memory_mb: u32,
    pub cpu: f32,
    pub pids: u32,
    pub nofile: u32,
    pub fsize_bytes: u64,
    pub output_bytes: usize,
    pub timeout: Duration,
}

/// Everything an adapter needs to run one phase of one job.
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub job_id: Uuid,
    pub phase: Phase,
    pub image: String,
    /// Command line with paths already expressed as the sandbox sees them.
    pub argv: Vec<String>,
    /// Job directory on the host; the only writable location in the sandbox.
    pub host_dir: PathBuf,
    /// Host path of the stdin file, if any.
    pub stdin: Option<PathBuf>,
    pub limits: PhaseLimits,
    pub user: (u32, u32),
}

/// How one phase ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub output_limit_exceeded: bool,
    pub cancelled: bool,
    pub oom_killed: bool,
    pub wall_ms: u64,
}

impl PhaseOutput {
    /// Exited on its own with status zero.
    pub fn succeeded(&self) -> bool {
        !self.timed_out
            && !self.output_limit_exceeded
            && !self.cancelled
            && !self.oom_killed
            && self.exit_code == Some(0)
    }
}

/// Cancel signal a running phase watches next to its timeout.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A token that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the sender is gone.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[async_trait]
pub trait SandboxInvoker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Where the job directory appears inside the sandbox.
    fn mount_point(&self, host_dir: &Path) -> PathBuf;

    /// Whether programs run under the worker's own uid.
    fn runs_as_worker(&self) -> bool {
        false
    }

    /// Run one phase. Resources created for it are released before returning.
    async fn run(
        &self,
        spec: &PhaseSpec,
        cancel: &mut CancelToken,
    ) -> Result<PhaseOutput, SandboxError>;
}

/// Build the adapter `config` selects. The Docker daemon must answer a ping;
/// the process adapter must be able to enforce every limit unless the
/// configuration explicitly accepts less.
pub async fn from_config(config: &EngineConfig) -> Result<Arc<dyn SandboxInvoker>, SandboxError> {
    match config.sandbox {
        SandboxKind::Docker => {
            let docker = DockerSandbox::connect()?;
            docker.ping().await?;
            Ok(Arc::new(docker))
        }
        SandboxKind::Process => Ok(Arc::new(ProcessSandbox::new(ProcessOptions::from_config(
            config,
        ))?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_token_fires_on_signal() {
        let (tx, rx) = watch::channel(false);
        let mut token = CancelToken::new(rx);
        assert!(!token.is_cancelled());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_token_does_not_fire() {
        let mut token = CancelToken::never();
        let fired = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_process_adapter_without_cgroups_needs_opt_in() {
        let config = EngineConfig {
            sandbox: SandboxKind::Process,
            cgroup_root: None,
            allow_unconfined_process: false,
            ..EngineConfig::default()
        };
        let err = from_config(&config).await.err().unwrap();
        assert!(matches!(err, SandboxError::Unconfined(_)));
        assert!(err.to_string().contains("CPU share"));

        let config = EngineConfig {
            allow_unconfined_process: true,
            ..config
        };
        let invoker = from_config(&config).await.unwrap();
        assert_eq!(invoker.name(), "process");
    }

    #[test]
    fn test_succeeded_requires_clean_zero_exit() {
        let ok = PhaseOutput {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.succeeded());
        assert!(!PhaseOutput {
            timed_out: true,
            ..ok.clone()
        }
        .succeeded());
        assert!(!PhaseOutput {
            exit_code: None,
            ..ok
        }
        .succeeded());
    }
}
