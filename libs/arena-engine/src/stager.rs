/// Code Stager
///
/// Writes a job's source (and stdin) into its own directory under the shared
/// temp root and renders the compile/run command lines for it.
///
/// **Naming:**
/// - directory: `arena-<job id>-<random>` (created atomically by `tempfile`)
/// - source:    `code_<token>.<ext>` or the profile's fixed `source_name`
/// - input:     `input_<token>.txt`
/// - binary:    `exec_<token>`
///
/// `<token>` is a fresh random id per job, so concurrent jobs never share a path.
///
/// **Permissions:**
/// The temp root is `0711`: the sandbox can traverse it but not list it.
/// Each job directory is `0700` and owned by whoever the sandbox runs as.
use crate::normalize::EntryPointNormalizer;
use arena_common::languages::{LanguageProfile, TemplateVars};
use arena_common::types::Job;
use nix::unistd::Uid;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("failed to prepare job directory: {0}")]
    Io(#[from] io::Error),

    #[error("language '{language}': {reason}")]
    Template { language: String, reason: String },
}

/// Files of one staged job. Dropping it deletes the directory.
#[derive(Debug)]
pub struct StagedJob {
    dir: Option<TempDir>,
    host_dir: PathBuf,
    pub source: PathBuf,
    pub input: Option<PathBuf>,
    pub binary: PathBuf,
    /// Compile argv as the sandbox sees it.
    pub compile: Option<Vec<String>>,
    /// Run argv as the sandbox sees it.
    pub run: Vec<String>,
}

impl StagedJob {
    pub fn host_dir(&self) -> &Path {
        &self.host_dir
    }

    /// Delete the job directory now. Idempotent.
    pub fn cleanup(&mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

/// Who may enter a job directory besides the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirAccess {
    /// `0700`, worker-owned. The sandbox runs under the worker's uid.
    Private,
    /// `0700`, handed to the sandbox uid/gid. Needs a root worker.
    Owner(u32, u32),
    /// `0777`, for a container user an unprivileged worker cannot chown to.
    /// Only the container that mounts the directory can reach it.
    Shared,
}

impl DirAccess {
    /// Pick the access for a sandbox running as `user`.
    pub fn resolve(user: (u32, u32), sandbox_runs_as_worker: bool) -> Self {
        if Uid::effective().is_root() {
            DirAccess::Owner(user.0, user.1)
        } else if sandbox_runs_as_worker {
            DirAccess::Private
        } else {
            DirAccess::Shared
        }
    }

    fn apply(self, dir: &Path) -> io::Result<()> {
        match self {
            DirAccess::Private => fs::set_permissions(dir, fs::Permissions::from_mode(0o700)),
            DirAccess::Owner(uid, gid) => {
                std::os::unix::fs::chown(dir, Some(uid), Some(gid))?;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            }
            DirAccess::Shared => fs::set_permissions(dir, fs::Permissions::from_mode(0o777)),
        }
    }
}

#[derive(Clone)]
pub struct Stager {
    temp_root: PathBuf,
    normalizer: Arc<dyn EntryPointNormalizer>,
    access: DirAccess,
}

impl Stager {
    pub fn new(temp_root: impl Into<PathBuf>, normalizer: Arc<dyn EntryPointNormalizer>) -> Self {
        Self {
            temp_root: temp_root.into(),
            normalizer,
            access: DirAccess::Private,
        }
    }

    pub fn with_access(mut self, access: DirAccess) -> Self {
        self.access = access;
        self
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Stage `job` for `profile`. `mount` maps the host job directory to the
    /// path the sandbox will see it at.
    pub fn stage(
        &self,
        job: &Job,
        profile: &LanguageProfile,
        mount: impl FnOnce(&Path) -> PathBuf,
    ) -> Result<StagedJob, StageError> {
        fs::create_dir_all(&self.temp_root)?;
        fs::set_permissions(&self.temp_root, fs::Permissions::from_mode(0o711))?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("arena-{}-", job.id.simple()))
            .tempdir_in(&self.temp_root)?;
        self.access.apply(dir.path())?;

        let host_dir = dir.path().to_path_buf();
        let sandbox_dir = mount(&host_dir);
        let token = Uuid::new_v4().simple().to_string();

        let source_name = profile
            .source_name
            .clone()
            .unwrap_or_else(|| format!("code_{}{}", token, profile.file_extension));
        let binary_name = format!("exec_{}", token);

        let code = match &profile.entry_class {
            Some(entry) => self.normalizer.normalize(&job.request.code, entry),
            None => job.request.code.clone(),
        };
        let source = host_dir.join(&source_name);
        write_file(&source, code.as_bytes())?;

        let input = match job.request.stdin.as_deref() {
            Some(stdin) if !stdin.is_empty() => {
                let path = host_dir.join(format!("input_{}.txt", token));
                write_file(&path, normalize_input(stdin).as_bytes())?;
                Some(path)
            }
            _ => None,
        };

        let sandbox_source = sandbox_dir.join(&source_name);
        let sandbox_binary = sandbox_dir.join(&binary_name);
        let sandbox_source = sandbox_source.to_string_lossy();
        let sandbox_binary = sandbox_binary.to_string_lossy();
        let sandbox_dir_str = sandbox_dir.to_string_lossy();
        let vars = TemplateVars {
            source: &sandbox_source,
            binary: &sandbox_binary,
            dir: &sandbox_dir_str,
            entry: profile.entry_class.as_deref().unwrap_or(""),
        };

        let template_error = |reason: String| StageError::Template {
            language: profile.name.to_string(),
            reason,
        };
        let compile = profile
            .compile
            .as_ref()
            .map(|template| template.render(&vars))
            .transpose()
            .map_err(template_error)?;
        let run = profile.run.render(&vars).map_err(template_error)?;

        Ok(StagedJob {
            dir: Some(dir),
            binary: host_dir.join(&binary_name),
            host_dir,
            source,
            input,
            compile,
            run,
        })
    }
}

/// Line-reading programs block or fail on a last line without a newline.
pub fn normalize_input(stdin: &str) -> String {
    if stdin.ends_with('\n') {
        stdin.to_string()
    } else {
        format!("{}\n", stdin)
    }
}

fn write_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}
