pub mod executor;
pub mod normalize;
pub mod pool;
pub mod sandbox;
pub mod stager;
pub mod stats;

pub use executor::{Executor, Progress};
pub use normalize::{EntryPointNormalizer, RegexJavaNormalizer};
pub use pool::{PoolStats, WorkerPool};
pub use sandbox::{
    CancelToken, DockerSandbox, ProcessOptions, ProcessSandbox, SandboxError, SandboxInvoker,
};
pub use stager::{DirAccess, StageError, StagedJob, Stager};
