use super::output::BoundedBuffer;
use super::{CancelToken, PhaseSpec, PhaseOutput, SandboxError, SandboxInvoker};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Where the job directory is mounted inside every container.
pub const SANDBOX_MOUNT: &str = "/sandbox";

const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Container cleanup guard - guarantees removal on drop
/// Covers panics and dropped futures; the normal path removes explicitly.
struct ContainerGuard {
    docker: Docker,
    container_id: Option<String>,
}

impl ContainerGuard {
    fn new(docker: &Docker, container_id: String) -> Self {
        Self {
            docker: docker.clone(),
            container_id: Some(container_id),
        }
    }

    async fn remove(mut self) {
        if let Some(id) = self.container_id.take() {
            remove_container(&self.docker, &id).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if let Some(id) = self.container_id.take() {
            let docker = self.docker.clone();
            // Cannot await in Drop
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { remove_container(&docker, &id).await });
            }
        }
    }
}

async fn remove_container(docker: &Docker, id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(id, Some(options)).await {
        warn!(container_id = %id, error = %e, "Failed to remove container");
    }
}

#[derive(Debug)]
enum Ending {
    Exited(Option<i64>),
    TimedOut,
    OutputLimit,
    Cancelled,
}

/// Docker-based adapter
///
/// **Container hardening:**
/// - no network (`network_disabled`, `network_mode: none`)
/// - memory ceiling with an equal swap ceiling
/// - CPU share via `nano_cpus`, pids cap, nofile/fsize ulimits
/// - read-only root, the job dir as the only writable bind, small tmpfs `/tmp`
/// - unprivileged user, `no-new-privileges`, every capability dropped
pub struct DockerSandbox {
    docker: Docker,
}

impl DockerSandbox {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Verify the image exists locally, pulling it on a cache miss.
    pub async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| SandboxError::Image {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    async fn kill(&self, container_id: &str) {
        let options = KillContainerOptions { signal: "SIGKILL" };
        if let Err(e) = self.docker.kill_container(container_id, Some(options)).await {
            debug!(container_id, error = %e, "Kill failed (container may have exited)");
        }
    }

    async fn wait_exit(&self, container_id: &str) -> Result<Option<i64>, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(Some(response.status_code)),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(Some(code)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn oom_killed(&self, container_id: &str) -> bool {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => details
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                debug!(container_id, error = %e, "Inspect failed");
                false
            }
        }
    }
}

/// Container configuration for one phase.
pub fn container_config(spec: &PhaseSpec) -> Config<String> {
    let memory = spec.limits.memory_mb as i64 * 1024 * 1024;
    let ulimit = |name: &str, value: i64| ResourcesUlimits {
        name: Some(name.to_string()),
        soft: Some(value),
        hard: Some(value),
    };

    let mut tmpfs = HashMap::new();
    tmpfs.insert("/tmp".to_string(), "rw,noexec,nosuid,size=16m".to_string());

    let has_stdin = spec.stdin.is_some();

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(spec.argv.clone()),
        user: Some(format!("{}:{}", spec.user.0, spec.user.1)),
        working_dir: Some(SANDBOX_MOUNT.to_string()),
        env: Some(vec![
            format!("HOME={}", SANDBOX_MOUNT),
            "LANG=C.UTF-8".to_string(),
        ]),
        attach_stdin: Some(has_stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(has_stdin),
        stdin_once: Some(has_stdin),
        tty: Some(false),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            network_mode: Some("none".to_string()),
            memory: Some(memory),
            memory_swap: Some(memory),
            nano_cpus: Some((spec.limits.cpu as f64 * 1_000_000_000.0) as i64),
            pids_limit: Some(spec.limits.pids as i64),
            ulimits: Some(vec![
                ulimit("nofile", spec.limits.nofile as i64),
                ulimit("nproc", spec.limits.pids as i64),
                ulimit("fsize", spec.limits.fsize_bytes as i64),
            ]),
            readonly_rootfs: Some(true),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            binds: Some(vec![format!(
                "{}:{}:rw",
                spec.host_dir.display(),
                SANDBOX_MOUNT
            )]),
            tmpfs: Some(tmpfs),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl SandboxInvoker for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn mount_point(&self, _host_dir: &Path) -> PathBuf {
        PathBuf::from(SANDBOX_MOUNT)
    }

    #[tracing::instrument(skip_all, fields(job_id = %spec.job_id, phase = %spec.phase, image = %spec.image))]
    async fn run(
        &self,
        spec: &PhaseSpec,
        cancel: &mut CancelToken,
    ) -> Result<PhaseOutput, SandboxError> {
        self.ensure_image(&spec.image).await?;

        let stdin_bytes = match &spec.stdin {
            Some(path) => Some(tokio::fs::read(path).await?),
            None => None,
        };

        let name = format!("arena-{}-{}", spec.phase, spec.job_id.simple());
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                container_config(spec),
            )
            .await
            .map_err(|e| SandboxError::Launch(format!("create container: {}", e)))?;
        let container_id = created.id;
        let guard = ContainerGuard::new(&self.docker, container_id.clone());

        // Attach before start so no early output is lost.
        let AttachContainerResults { mut output, mut input } = self
            .docker
            .attach_container(
                &container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(stdin_bytes.is_some()),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::Launch(format!("attach container: {}", e)))?;

        let cap = spec.limits.output_bytes;
        let overflow = Arc::new(Notify::new());
        let collector_overflow = overflow.clone();
        let collector = tokio::spawn(async move {
            let mut stdout = BoundedBuffer::new(cap);
            let mut stderr = BoundedBuffer::new(cap);
            while let Some(frame) = output.next().await {
                let fits = match frame {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => true,
                    Err(e) => {
                        debug!(error = %e, "Attach stream ended with error");
                        break;
                    }
                };
                if !fits {
                    collector_overflow.notify_one();
                    break;
                }
            }
            (stdout, stderr)
        });

        let start = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Launch(format!("start container: {}", e)))?;

        if let Some(bytes) = stdin_bytes {
            // A program that exits without reading makes this fail; that is fine.
            if let Err(e) = input.write_all(&bytes).await {
                debug!(error = %e, "Writing stdin failed");
            }
            let _ = input.shutdown().await;
        }

        let ending = tokio::select! {
            code = self.wait_exit(&container_id) => Ending::Exited(code?),
            _ = tokio::time::sleep(spec.limits.timeout) => Ending::TimedOut,
            _ = overflow.notified() => Ending::OutputLimit,
            _ = cancel.cancelled() => Ending::Cancelled,
        };
        let wall_ms = start.elapsed().as_millis() as u64;

        let exit_code = match ending {
            Ending::Exited(code) => code,
            _ => {
                debug!(?ending, "Killing container");
                self.kill(&container_id).await;
                self.wait_exit(&container_id).await.unwrap_or(None)
            }
        };

        let oom_killed = matches!(ending, Ending::Exited(_)) && self.oom_killed(&container_id).await;

        let collector_abort = collector.abort_handle();
        let (stdout, stderr) = match tokio::time::timeout(DRAIN_GRACE, collector).await {
            Ok(Ok(buffers)) => buffers,
            _ => {
                collector_abort.abort();
                warn!("Attach stream did not close, discarding output");
                (BoundedBuffer::new(cap), BoundedBuffer::new(cap))
            }
        };

        guard.remove().await;

        let output_limit_exceeded =
            matches!(ending, Ending::OutputLimit) || stdout.is_truncated() || stderr.is_truncated();

        Ok(PhaseOutput {
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            exit_code,
            timed_out: matches!(ending, Ending::TimedOut),
            output_limit_exceeded,
            cancelled: matches!(ending, Ending::Cancelled),
            oom_killed,
            wall_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{Phase, PhaseLimits};
    use uuid::Uuid;

    fn spec(stdin: Option<PathBuf>) -> PhaseSpec {
        PhaseSpec {
            job_id: Uuid::new_v4(),
            phase: Phase::Run,
            image: "arena-python:latest".to_string(),
            argv: vec!["python3".to_string(), "/sandbox/code.py".to_string()],
            host_dir: PathBuf::from("/tmp/arena/job"),
            stdin,
            limits: PhaseLimits {
                memory_mb: 128,
                cpu: 0.5,
                pids: 64,
                nofile: 64,
                fsize_bytes: 1_000_000,
                output_bytes: 1024 * 1024,
                timeout: Duration::from_secs(10),
            },
            user: (1000, 1000),
        }
    }

    #[test]
    fn test_container_is_hardened() {
        let config = container_config(&spec(None));
        let host = config.host_config.unwrap();

        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.security_opt, Some(vec!["no-new-privileges".to_string()]));
        assert_eq!(host.binds, Some(vec!["/tmp/arena/job:/sandbox:rw".to_string()]));
        assert_eq!(config.user.as_deref(), Some("1000:1000"));

        let ulimits = host.ulimits.unwrap();
        let nofile = ulimits
            .iter()
            .find(|u| u.name.as_deref() == Some("nofile"))
            .unwrap();
        assert_eq!(nofile.hard, Some(64));
    }

    #[test]
    fn test_stdin_only_opened_when_input_exists() {
        let without = container_config(&spec(None));
        assert_eq!(without.open_stdin, Some(false));

        let with = container_config(&spec(Some(PathBuf::from("/tmp/arena/job/input.txt"))));
        assert_eq!(with.open_stdin, Some(true));
        assert_eq!(with.stdin_once, Some(true));
    }

    // Requires a Docker daemon and the arena-python image.
    #[tokio::test]
    #[ignore]
    async fn test_runs_python_in_container() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("code.py"), "print(1 + 1)\n").unwrap();

        let mut phase = spec(None);
        phase.host_dir = dir.path().to_path_buf();

        let sandbox = DockerSandbox::connect().unwrap();
        let out = sandbox.run(&phase, &mut CancelToken::never()).await.unwrap();
        assert_eq!(out.stdout.trim_end(), "2");
        assert_eq!(out.exit_code, Some(0));
    }
}
