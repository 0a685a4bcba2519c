use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Languages the engine knows how to stage, compile and run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Java,
    Cpp,
    C,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::JavaScript,
        Language::TypeScript,
        Language::Java,
        Language::Cpp,
        Language::C,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::C => "c",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown language identifier, carries the raw input for the error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "typescript" | "ts" => Ok(Language::TypeScript),
            "java" => Ok(Language::Java),
            "cpp" | "c++" => Ok(Language::Cpp),
            "c" => Ok(Language::C),
            _ => Err(UnknownLanguage(s.to_string())),
        }
    }
}

/// A validated request to execute code. Immutable once admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

/// One admitted request, owned by the queue until a single worker claims it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub request: ExecutionRequest,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl Job {
    pub fn new(request: ExecutionRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Terminal classification of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStatus {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    OutputLimitExceeded,
    InfraError,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::CompileError => "compileError",
            ExecutionStatus::RuntimeError => "runtimeError",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::OutputLimitExceeded => "outputLimitExceeded",
            ExecutionStatus::InfraError => "infraError",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    /// True when the failure belongs to the service rather than the submitted code.
    pub fn is_infrastructure_failure(&self) -> bool {
        matches!(self, ExecutionStatus::InfraError)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one job, produced exactly once by the worker that ran it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub status: ExecutionStatus,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub runtime_ms: u64,
    pub memory_kb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

impl ExecutionResult {
    pub fn infra_error(job_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            job_id,
            status: ExecutionStatus::InfraError,
            output: String::new(),
            error: Some(message.into()),
            runtime_ms: 0,
            memory_kb: 0,
            exit_code: None,
        }
    }

    pub fn cancelled(job_id: Uuid) -> Self {
        Self {
            job_id,
            status: ExecutionStatus::Cancelled,
            output: String::new(),
            error: Some("Job was cancelled".to_string()),
            runtime_ms: 0,
            memory_kb: 0,
            exit_code: None,
        }
    }
}

/// Lifecycle of a job from admission to teardown.
///
/// ```text
/// Queued -> Claimed -> Staging -> (Compiling) -> Running -> {Completed | Failed | TimedOut} -> CleanedUp
/// ```
///
/// Any non-terminal state may also move to `Failed` (infrastructure error,
/// cancellation, or a compile error short-circuiting the run phase).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Queued,
    Claimed,
    Staging,
    Compiling,
    Running,
    Completed,
    Failed,
    TimedOut,
    CleanedUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid job state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut | JobState::CleanedUp
        )
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Claimed) => true,
            (Claimed, Staging) => true,
            (Staging, Compiling) | (Staging, Running) => true,
            (Compiling, Running) => true,
            (Compiling, TimedOut) | (Running, TimedOut) => true,
            (Running, Completed) => true,
            (Queued | Claimed | Staging | Compiling | Running, Failed) => true,
            (Completed | Failed | TimedOut, CleanedUp) => true,
            _ => false,
        }
    }

    pub fn transition(self, next: JobState) -> Result<JobState, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition { from: self, to: next })
        }
    }

    /// Terminal state matching a result classification.
    pub fn for_status(status: ExecutionStatus) -> JobState {
        match status {
            ExecutionStatus::Success => JobState::Completed,
            ExecutionStatus::Timeout => JobState::TimedOut,
            _ => JobState::Failed,
        }
    }
}
