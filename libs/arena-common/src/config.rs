// Engine configuration
// Every limit comes from the environment, with one coherent default set.

use crate::types::Language;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key}: {reason}")]
    OutOfRange { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Redis,
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(QueueBackend::Redis),
            "memory" | "in-memory" => Ok(QueueBackend::Memory),
            other => Err(format!("expected 'redis' or 'memory', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Docker,
    Process,
}

impl FromStr for SandboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" | "container" => Ok(SandboxKind::Docker),
            "process" | "subprocess" => Ok(SandboxKind::Process),
            other => Err(format!("expected 'docker' or 'process', got '{}'", other)),
        }
    }
}

/// Per-job resource ceilings handed to the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub compile_memory_mb: u32,
    pub cpu_limit: f32,
    pub pids: u32,
    pub nofile: u32,
    pub fsize_bytes: u64,
    pub output_bytes: usize,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    #[serde(with = "duration_ms")]
    pub compile_timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            compile_memory_mb: 512,
            cpu_limit: 0.5,
            pids: 64,
            nofile: 64,
            fsize_bytes: 1_000_000,
            output_bytes: 1024 * 1024,
            timeout: Duration::from_secs(10),
            compile_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-wide configuration shared by the API, the worker and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub port: u16,
    pub worker_health_port: u16,
    pub queue_backend: QueueBackend,
    pub redis_url: String,
    pub languages_file: PathBuf,
    pub enabled_languages: Vec<Language>,
    pub sandbox: SandboxKind,
    pub workers: usize,
    pub max_code_bytes: usize,
    pub max_input_bytes: usize,
    #[serde(with = "duration_ms")]
    pub queue_wait: Duration,
    pub limits: ResourceLimits,
    pub temp_root: PathBuf,
    pub sandbox_user: (u32, u32),
    pub time_wrapper: Option<PathBuf>,
    #[serde(with = "duration_ms")]
    pub result_ttl: Duration,
    pub isolate_network: bool,
    /// Delegated cgroup v2 directory the process adapter creates job scopes under.
    pub cgroup_root: Option<PathBuf>,
    /// Let the process adapter start without Landlock or cgroups.
    pub allow_unconfined_process: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            worker_health_port: 3002,
            queue_backend: QueueBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            languages_file: PathBuf::from("config/languages.json"),
            enabled_languages: Vec::new(),
            sandbox: SandboxKind::Docker,
            workers: 4,
            max_code_bytes: 64 * 1024,
            max_input_bytes: 64 * 1024,
            queue_wait: Duration::from_secs(60),
            limits: ResourceLimits::default(),
            temp_root: std::env::temp_dir().join("arena"),
            sandbox_user: (1000, 1000),
            time_wrapper: None,
            result_ttl: Duration::from_secs(3600),
            isolate_network: true,
            cgroup_root: None,
            allow_unconfined_process: false,
        }
    }
}

impl EngineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };
        let defaults = Self::default();
        let default_limits = ResourceLimits::default();

        let limits = ResourceLimits {
            memory_mb: env.parse("ARENA_MEMORY_LIMIT_MB", default_limits.memory_mb)?,
            compile_memory_mb: env.parse(
                "ARENA_COMPILE_MEMORY_LIMIT_MB",
                default_limits.compile_memory_mb,
            )?,
            cpu_limit: env.parse("ARENA_CPU_LIMIT", default_limits.cpu_limit)?,
            pids: env.parse("ARENA_PIDS_LIMIT", default_limits.pids)?,
            nofile: env.parse("ARENA_NOFILE_LIMIT", default_limits.nofile)?,
            fsize_bytes: env.parse("ARENA_FSIZE_LIMIT_BYTES", default_limits.fsize_bytes)?,
            output_bytes: env.parse("ARENA_OUTPUT_LIMIT_BYTES", default_limits.output_bytes)?,
            timeout: env.millis("ARENA_TIMEOUT_MS", default_limits.timeout)?,
            compile_timeout: env.millis("ARENA_COMPILE_TIMEOUT_MS", default_limits.compile_timeout)?,
        };

        let redis_url = lookup("ARENA_REDIS_URL")
            .or_else(|| lookup("REDIS_URL"))
            .unwrap_or(defaults.redis_url);

        let enabled_languages = match lookup("ARENA_LANGUAGES") {
            Some(list) => parse_language_list(&list)?,
            None => Vec::new(),
        };

        let sandbox_user = match lookup("ARENA_SANDBOX_USER") {
            Some(value) => parse_user(&value)?,
            None => defaults.sandbox_user,
        };

        let config = Self {
            port: env.parse("ARENA_PORT", defaults.port)?,
            worker_health_port: env.parse("ARENA_WORKER_HEALTH_PORT", defaults.worker_health_port)?,
            queue_backend: env.parse("ARENA_QUEUE_BACKEND", defaults.queue_backend)?,
            redis_url,
            languages_file: lookup("ARENA_LANGUAGES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.languages_file),
            enabled_languages,
            sandbox: env.parse("ARENA_SANDBOX", defaults.sandbox)?,
            workers: env.parse("ARENA_WORKERS", defaults.workers)?,
            max_code_bytes: env.parse("ARENA_MAX_CODE_BYTES", defaults.max_code_bytes)?,
            max_input_bytes: env.parse("ARENA_MAX_INPUT_BYTES", defaults.max_input_bytes)?,
            queue_wait: env.millis("ARENA_QUEUE_WAIT_MS", defaults.queue_wait)?,
            limits,
            temp_root: lookup("ARENA_TEMP_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_root),
            sandbox_user,
            time_wrapper: lookup("ARENA_TIME_WRAPPER")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            result_ttl: Duration::from_secs(
                env.parse("ARENA_RESULT_TTL_SECS", defaults.result_ttl.as_secs())?,
            ),
            isolate_network: env.parse("ARENA_ISOLATE_NETWORK", defaults.isolate_network)?,
            cgroup_root: lookup("ARENA_CGROUP_ROOT")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            allow_unconfined_process: env.parse(
                "ARENA_ALLOW_UNCONFINED_PROCESS",
                defaults.allow_unconfined_process,
            )?,
        };

        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        let range = |key: &'static str, reason: &str| ConfigError::OutOfRange {
            key,
            reason: reason.to_string(),
        };

        if self.workers == 0 {
            return Err(range("ARENA_WORKERS", "must be at least 1"));
        }
        if self.max_code_bytes == 0 {
            return Err(range("ARENA_MAX_CODE_BYTES", "must be positive"));
        }
        if self.limits.memory_mb < 16 {
            return Err(range("ARENA_MEMORY_LIMIT_MB", "must be at least 16"));
        }
        if !(self.limits.cpu_limit > 0.0) {
            return Err(range("ARENA_CPU_LIMIT", "must be positive"));
        }
        if self.limits.pids == 0 || self.limits.nofile == 0 {
            return Err(range("ARENA_PIDS_LIMIT", "process and fd caps must be positive"));
        }
        if self.limits.output_bytes == 0 {
            return Err(range("ARENA_OUTPUT_LIMIT_BYTES", "must be positive"));
        }
        if self.limits.timeout.is_zero() || self.limits.compile_timeout.is_zero() {
            return Err(range("ARENA_TIMEOUT_MS", "timeouts must be positive"));
        }
        Ok(())
    }

    /// Upper bound on how long one job may take once a worker picks it up.
    pub fn job_budget(&self) -> Duration {
        self.limits.compile_timeout + self.limits.timeout + Duration::from_secs(5)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<'a, F: Fn(&str) -> Option<String>> Env<'a, F> {
    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            Some(raw) if !raw.trim().is_empty() => {
                raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                    key,
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            }
            _ => Ok(default),
        }
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let ms = self.parse(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }
}

fn parse_language_list(list: &str) -> Result<Vec<Language>, ConfigError> {
    let mut languages = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let language = item.parse::<Language>().map_err(|_| ConfigError::Invalid {
            key: "ARENA_LANGUAGES",
            value: list.to_string(),
            reason: format!("unsupported language: {}", item),
        })?;
        if !languages.contains(&language) {
            languages.push(language);
        }
    }
    Ok(languages)
}

fn parse_user(value: &str) -> Result<(u32, u32), ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key: "ARENA_SANDBOX_USER",
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let (uid, gid) = value.split_once(':').ok_or_else(|| invalid("expected uid:gid"))?;
    let uid = uid.trim().parse().map_err(|_| invalid("uid is not a number"))?;
    let gid = gid.trim().parse().map_err(|_| invalid("gid is not a number"))?;
    if uid == 0 {
        return Err(invalid("the sandbox must not run as root"));
    }
    Ok((uid, gid))
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
