// Landlock filesystem confinement for the process adapter.
// The ruleset is built in the parent; the forked child only calls
// restrict_self on it.

use super::SandboxError;
use landlock::{
    Access, AccessFs, CompatLevel, Compatible, PathBeneath, PathFd, Ruleset, RulesetAttr,
    RulesetCreated, RulesetCreatedAttr, RulesetError, ABI,
};
use std::path::Path;

const TARGET_ABI: ABI = ABI::V3;

/// Trees a program may read and execute from.
const SYSTEM_DIRS: [&str; 7] = ["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc", "/opt"];

fn handled() -> Result<Ruleset, RulesetError> {
    // V1 rights are mandatory; newer ones are taken when the kernel has them.
    Ruleset::default()
        .set_compatibility(CompatLevel::HardRequirement)
        .handle_access(AccessFs::from_all(ABI::V1))?
        .set_compatibility(CompatLevel::BestEffort)
        .handle_access(AccessFs::from_all(TARGET_ABI))
}

/// Whether this kernel enforces Landlock.
pub fn supported() -> bool {
    handled().and_then(|ruleset| ruleset.create()).is_ok()
}

fn unconfined(e: RulesetError) -> SandboxError {
    SandboxError::Unconfined(format!("landlock: {}", e))
}

/// Ruleset that leaves `job_dir` as the only writable tree. System
/// directories stay readable and executable; everything else is denied.
pub fn job_ruleset(job_dir: &Path) -> Result<RulesetCreated, SandboxError> {
    let mut ruleset = handled().and_then(|r| r.create()).map_err(unconfined)?;

    let read_exec = AccessFs::from_read(TARGET_ABI);
    for dir in SYSTEM_DIRS {
        // Missing on this host is fine; nothing beneath it to grant.
        if let Ok(fd) = PathFd::new(dir) {
            ruleset = ruleset.add_rule(PathBeneath::new(fd, read_exec)).map_err(unconfined)?;
        }
    }
    if let Ok(fd) = PathFd::new("/proc") {
        ruleset = ruleset
            .add_rule(PathBeneath::new(fd, AccessFs::ReadFile | AccessFs::ReadDir))
            .map_err(unconfined)?;
    }
    if let Ok(fd) = PathFd::new("/dev") {
        ruleset = ruleset
            .add_rule(PathBeneath::new(
                fd,
                AccessFs::ReadFile | AccessFs::WriteFile | AccessFs::ReadDir,
            ))
            .map_err(unconfined)?;
    }

    let job = PathFd::new(job_dir)
        .map_err(|e| SandboxError::Launch(format!("{}: {}", job_dir.display(), e)))?;
    ruleset
        .add_rule(PathBeneath::new(job, AccessFs::from_all(TARGET_ABI)))
        .map_err(unconfined)
}
