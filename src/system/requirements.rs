//! Runtime requirements checking implementation.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SystemRequirementsError};

/// Results of all runtime requirement checks.
#[derive(Debug, Clone)]
pub struct RuntimeRequirements {
    /// Resolved path of the bwrap binary.
    pub bwrap_path: PathBuf,
    /// Whether /dev/ptmx is present.
    pub ptmx: bool,
    /// Whether unprivileged user namespaces are enabled.
    pub user_namespaces: bool,
}

/// Check all runtime requirements and return detailed results.
///
/// Returns `Ok(RuntimeRequirements)` with all check results, or `Err` with
/// the first failing requirement.
pub fn check_all() -> Result<RuntimeRequirements> {
    check_os()?;
    let bwrap_path = check_bwrap()?;
    let ptmx = check_ptmx()?;
    let user_namespaces = check_user_namespaces()?;

    Ok(RuntimeRequirements {
        bwrap_path,
        ptmx,
        user_namespaces,
    })
}

/// The sandbox helper, the mount plan, and the account provisioner are all
/// Linux-only.
fn check_os() -> Result<()> {
    if cfg!(target_os = "linux") {
        return Ok(());
    }
    Err(SystemRequirementsError::UnsupportedOs {
        found: std::env::consts::OS.to_string(),
    }
    .into())
}

/// Check that bwrap is resolvable on PATH (or at its usual home).
pub fn check_bwrap() -> Result<PathBuf> {
    resolve_on_path("bwrap").ok_or_else(|| SystemRequirementsError::BwrapUnavailable.into())
}

fn resolve_on_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Check that the PTY multiplexer device exists.
pub fn check_ptmx() -> Result<bool> {
    if Path::new("/dev/ptmx").exists() {
        return Ok(true);
    }
    Err(SystemRequirementsError::PtmxUnavailable.into())
}

/// Check unprivileged user namespaces are enabled.
///
/// Reads `/proc/sys/kernel/unprivileged_userns_clone` if it exists. On some
/// systems (Ubuntu), this file doesn't exist and user namespaces are always
/// enabled, so we fall back to actually testing the capability.
pub fn check_user_namespaces() -> Result<bool> {
    let userns_path = Path::new("/proc/sys/kernel/unprivileged_userns_clone");

    if !userns_path.exists() {
        return verify_userns_by_clone();
    }

    let content =
        fs::read_to_string(userns_path).map_err(|e| SystemRequirementsError::ReadFailed {
            context: "unprivileged_userns_clone".to_string(),
            source: e,
        })?;

    let value = content.trim().parse::<u32>().unwrap_or(0);

    if value != 1 {
        return Err(SystemRequirementsError::UserNamespacesDisabled.into());
    }

    Ok(true)
}

/// Verify user namespaces by attempting to unshare with CLONE_NEWUSER.
fn verify_userns_by_clone() -> Result<bool> {
    use nix::sched::{CloneFlags, unshare};

    // Fork a child to test user namespace creation
    match unsafe { nix::unistd::fork() } {
        Ok(nix::unistd::ForkResult::Parent { child }) => {
            match nix::sys::wait::waitpid(child, None) {
                Ok(nix::sys::wait::WaitStatus::Exited(_, 0)) => Ok(true),
                _ => Err(SystemRequirementsError::UserNamespacesDisabled.into()),
            }
        }
        Ok(nix::unistd::ForkResult::Child) => {
            let result = unshare(CloneFlags::CLONE_NEWUSER);
            std::process::exit(if result.is_ok() { 0 } else { 1 });
        }
        Err(_) => Err(SystemRequirementsError::ReadFailed {
            context: "fork for userns test".to_string(),
            source: std::io::Error::last_os_error(),
        }
        .into()),
    }
}
