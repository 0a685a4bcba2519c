pub mod config;
pub mod languages;
pub mod logging;
pub mod queue;
pub mod redis;
pub mod types;
pub mod validation;

pub use config::{ConfigError, EngineConfig, QueueBackend, ResourceLimits, SandboxKind};
pub use languages::{LanguageProfile, LanguageTable, LanguageTableError};
pub use queue::{JobConsumer, JobQueue, MemoryQueue, QueueError};
pub use types::{ExecutionRequest, ExecutionResult, ExecutionStatus, Job, JobState, Language};
pub use validation::{AdmissionPolicy, Submission, ValidationError};
