/// Job Executor - drives one job through stage, compile, run, classify
///
/// **Core Responsibility:**
/// Turn a claimed `Job` into exactly one `ExecutionResult`.
///
/// **Pipeline:**
/// 1. Stage source/stdin into a per-job directory
/// 2. Compile phase (compiled languages only); failure short-circuits
/// 3. Run phase with stdin, timeout, output cap
/// 4. Classify and release the job directory
///
/// Sandbox machinery failures become `infraError`; the user's program
/// failing never does.
use crate::sandbox::{
    CancelToken, Phase, PhaseLimits, PhaseOutput, PhaseSpec, SandboxError, SandboxInvoker,
};
use crate::stager::{DirAccess, StagedJob, Stager};
use crate::stats::{extract_stats, wrap_command, StatsCollector};
use arena_common::config::{EngineConfig, ResourceLimits};
use arena_common::languages::{LanguageProfile, LanguageTable};
use arena_common::types::{ExecutionResult, ExecutionStatus, Job, JobState};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Appended to the error text of a run killed by the memory ceiling.
pub const MEMORY_LIMIT_NOTE: &str = "[memory limit exceeded]";

/// Sink for lifecycle transitions while a job runs.
#[derive(Debug, Clone, Default)]
pub struct Progress(Option<mpsc::UnboundedSender<JobState>>);

impl Progress {
    pub fn new(tx: mpsc::UnboundedSender<JobState>) -> Self {
        Self(Some(tx))
    }

    pub fn silent() -> Self {
        Self(None)
    }

    fn report(&self, state: JobState) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(state);
        }
    }
}

pub struct Executor {
    invoker: Arc<dyn SandboxInvoker>,
    languages: Arc<LanguageTable>,
    stager: Stager,
    limits: ResourceLimits,
    user: (u32, u32),
    time_wrapper: Option<PathBuf>,
}

impl Executor {
    pub fn new(
        invoker: Arc<dyn SandboxInvoker>,
        languages: Arc<LanguageTable>,
        stager: Stager,
        config: &EngineConfig,
    ) -> Self {
        let access = DirAccess::resolve(config.sandbox_user, invoker.runs_as_worker());
        Self {
            invoker,
            languages,
            stager: stager.with_access(access),
            limits: config.limits.clone(),
            user: config.sandbox_user,
            time_wrapper: config.time_wrapper.clone(),
        }
    }

    pub fn sandbox_name(&self) -> &'static str {
        self.invoker.name()
    }

    pub fn languages(&self) -> &LanguageTable {
        &self.languages
    }

    /// Run `job` to a result. Never fails; infrastructure problems are a result too.
    #[tracing::instrument(skip_all, fields(job_id = %job.id, language = %job.request.language))]
    pub async fn execute(
        &self,
        job: &Job,
        progress: &Progress,
        mut cancel: CancelToken,
    ) -> ExecutionResult {
        let Some(profile) = self.languages.get(job.request.language) else {
            return ExecutionResult::infra_error(
                job.id,
                format!("language '{}' is not configured", job.request.language),
            );
        };

        progress.report(JobState::Staging);
        debug!(
            code_bytes = job.request.code.len(),
            stdin_bytes = job.request.stdin.as_ref().map_or(0, |s| s.len()),
            "Staging job"
        );
        let mut staged = match self
            .stager
            .stage(job, profile, |dir| self.invoker.mount_point(dir))
        {
            Ok(staged) => staged,
            Err(e) => {
                warn!(error = %e, "Staging failed");
                return ExecutionResult::infra_error(job.id, e.to_string());
            }
        };

        let result = match self.pipeline(job, profile, &staged, progress, &mut cancel).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, sandbox = self.invoker.name(), "Sandbox failure");
                ExecutionResult::infra_error(job.id, e.to_string())
            }
        };

        if let Err(e) = staged.cleanup() {
            warn!(error = %e, dir = %staged.host_dir().display(), "Failed to remove job directory");
        }

        info!(
            status = %result.status,
            runtime_ms = result.runtime_ms,
            memory_kb = result.memory_kb,
            "Job finished"
        );
        result
    }

    async fn pipeline(
        &self,
        job: &Job,
        profile: &LanguageProfile,
        staged: &StagedJob,
        progress: &Progress,
        cancel: &mut CancelToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let run_memory = profile.memory_limit_mb.unwrap_or(self.limits.memory_mb);
        let mut stats = StatsCollector::new(run_memory);

        if cancel.is_cancelled() {
            return Ok(ExecutionResult::cancelled(job.id));
        }

        if let Some(compile_argv) = &staged.compile {
            progress.report(JobState::Compiling);
            let spec = self.phase_spec(
                job,
                profile,
                staged,
                Phase::Compile,
                compile_argv.clone(),
                PhaseLimits {
                    memory_mb: self.limits.compile_memory_mb.max(run_memory),
                    timeout: self.limits.compile_timeout,
                    ..self.phase_limits(profile, run_memory)
                },
            );
            let out = self.invoker.run(&spec, cancel).await?;
            let (stderr, _) = self.split_stats(&out);
            stats.record(out.wall_ms, None);

            if !out.succeeded() {
                return Ok(classify_compile(job, PhaseOutput { stderr, ..out }, &stats, &spec));
            }
            debug!(compile_ms = out.wall_ms, "Compilation succeeded");
        }

        progress.report(JobState::Running);
        let spec = self.phase_spec(
            job,
            profile,
            staged,
            Phase::Run,
            staged.run.clone(),
            self.phase_limits(profile, run_memory),
        );
        let out = self.invoker.run(&spec, cancel).await?;
        let (stderr, peak_kb) = self.split_stats(&out);
        stats.record(out.wall_ms, peak_kb);

        Ok(classify_run(job, PhaseOutput { stderr, ..out }, &stats, &spec))
    }

    /// The wrapper's report, when a wrapper ran and its line survived the
    /// output cap. Otherwise stderr is entirely the program's.
    fn split_stats(&self, out: &PhaseOutput) -> (String, Option<u64>) {
        if self.time_wrapper.is_none() || out.output_limit_exceeded {
            return (out.stderr.clone(), None);
        }
        extract_stats(&out.stderr)
    }

    fn phase_limits(&self, profile: &LanguageProfile, memory_mb: u32) -> PhaseLimits {
        PhaseLimits {
            memory_mb,
            cpu: profile.cpu_limit.unwrap_or(self.limits.cpu_limit),
            pids: self.limits.pids,
            nofile: self.limits.nofile,
            fsize_bytes: self.limits.fsize_bytes,
            output_bytes: self.limits.output_bytes,
            timeout: self.limits.timeout,
        }
    }

    fn phase_spec(
        &self,
        job: &Job,
        profile: &LanguageProfile,
        staged: &StagedJob,
        phase: Phase,
        argv: Vec<String>,
        limits: PhaseLimits,
    ) -> PhaseSpec {
        PhaseSpec {
            job_id: job.id,
            phase,
            image: profile.image.clone(),
            argv: wrap_command(self.time_wrapper.as_deref(), argv),
            host_dir: staged.host_dir().to_path_buf(),
            stdin: match phase {
                Phase::Compile => None,
                Phase::Run => staged.input.clone(),
            },
            limits,
            user: self.user,
        }
    }
}

fn build_result(
    job: &Job,
    status: ExecutionStatus,
    output: String,
    error: Option<String>,
    out: &PhaseOutput,
    stats: &StatsCollector,
) -> ExecutionResult {
    ExecutionResult {
        job_id: job.id,
        status,
        output,
        error,
        runtime_ms: stats.runtime_ms(),
        memory_kb: stats.memory_kb(),
        exit_code: out.exit_code,
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Shared endings of either phase; `None` means the phase exited on its own.
fn classify_abnormal(
    job: &Job,
    out: &PhaseOutput,
    stats: &StatsCollector,
    spec: &PhaseSpec,
) -> Option<ExecutionResult> {
    if out.cancelled {
        let mut cancelled = ExecutionResult::cancelled(job.id);
        cancelled.runtime_ms = stats.runtime_ms();
        return Some(cancelled);
    }
    if out.timed_out {
        let message = match spec.phase {
            Phase::Compile => format!(
                "Compilation timed out after {}ms",
                spec.limits.timeout.as_millis()
            ),
            Phase::Run => format!(
                "Execution timed out after {}ms",
                spec.limits.timeout.as_millis()
            ),
        };
        return Some(build_result(
            job,
            ExecutionStatus::Timeout,
            out.stdout.trim_end().to_string(),
            Some(message),
            out,
            stats,
        ));
    }
    if out.output_limit_exceeded {
        let message = format!("Output limit of {} bytes exceeded", spec.limits.output_bytes);
        return Some(build_result(
            job,
            ExecutionStatus::OutputLimitExceeded,
            out.stdout.trim_end().to_string(),
            Some(message),
            out,
            stats,
        ));
    }
    None
}

fn classify_compile(
    job: &Job,
    out: PhaseOutput,
    stats: &StatsCollector,
    spec: &PhaseSpec,
) -> ExecutionResult {
    if let Some(abnormal) = classify_abnormal(job, &out, stats, spec) {
        return abnormal;
    }
    // Compiler diagnostics verbatim; some compilers write them to stdout.
    let diagnostics = if out.stderr.trim().is_empty() {
        out.stdout.clone()
    } else {
        out.stderr.clone()
    };
    let mut error = diagnostics.clone();
    if out.oom_killed {
        error = format!("{}\n{}", error.trim_end(), MEMORY_LIMIT_NOTE);
    }
    build_result(job, ExecutionStatus::CompileError, diagnostics, Some(error), &out, stats)
}

fn classify_run(
    job: &Job,
    out: PhaseOutput,
    stats: &StatsCollector,
    spec: &PhaseSpec,
) -> ExecutionResult {
    if let Some(abnormal) = classify_abnormal(job, &out, stats, spec) {
        return abnormal;
    }
    let output = out.stdout.trim_end().to_string();

    if out.succeeded() {
        let warnings = non_empty(&out.stderr);
        return build_result(job, ExecutionStatus::Success, output, warnings, &out, stats);
    }

    let mut error = non_empty(&out.stderr).unwrap_or_else(|| match out.exit_code {
        Some(code) => format!("Process exited with code {}", code),
        None => "Process exited abnormally".to_string(),
    });
    if out.oom_killed {
        error = format!("{}\n{}", error, MEMORY_LIMIT_NOTE);
    }
    build_result(job, ExecutionStatus::RuntimeError, output, Some(error), &out, stats)
}
