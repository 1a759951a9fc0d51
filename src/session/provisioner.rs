//! System account provisioning.
//!
//! Session creation needs a real system account behind the uid. The
//! [`AccountProvisioner`] trait keeps that pluggable: the default
//! implementation shells out to the usual user-management binaries, while
//! tests substitute an in-memory fake.

use std::path::Path;
use std::process::Command;

use nix::unistd::{Gid, Uid, chown};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::SessionError;

/// Creates and removes the system accounts backing sessions.
pub trait AccountProvisioner: Send + Sync {
    /// Ensures a group with `gid` exists. Idempotent.
    fn ensure_group(&self, gid: u32, name: &str) -> Result<(), SessionError>;

    /// Ensures a user account exists with the given identity and home.
    /// Idempotent: an already-existing account is success.
    fn ensure_user(
        &self,
        uid: u32,
        gid: u32,
        name: &str,
        home: &Path,
        shell: &str,
    ) -> Result<(), SessionError>;

    /// Deletes a user account. Best effort.
    fn delete_user(&self, name: &str) -> Result<(), SessionError>;

    /// Recursively chowns `path` to `uid:gid`.
    fn recursive_chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), SessionError>;
}

/// Default provisioner: shells out to `groupadd`, `useradd`, and `userdel`.
#[derive(Debug, Default)]
pub struct ShellAccounts;

/// useradd's exit status for "account already exists".
const USERADD_EXISTS: i32 = 9;

impl ShellAccounts {
    fn run(uid: u32, mut cmd: Command) -> Result<(), SessionError> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        let output = cmd.output().map_err(|source| SessionError::IoError {
            context: format!("spawning {program}"),
            source,
        })?;

        if output.status.success() {
            return Ok(());
        }
        Err(SessionError::Provision {
            uid,
            reason: format!(
                "{program} exited {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

impl AccountProvisioner for ShellAccounts {
    fn ensure_group(&self, gid: u32, name: &str) -> Result<(), SessionError> {
        let mut cmd = Command::new("groupadd");
        cmd.args(["--gid", &gid.to_string(), "--force", name]);
        Self::run(gid, cmd)
    }

    fn ensure_user(
        &self,
        uid: u32,
        gid: u32,
        name: &str,
        home: &Path,
        shell: &str,
    ) -> Result<(), SessionError> {
        let mut cmd = Command::new("useradd");
        cmd.args(["--uid", &uid.to_string()])
            .args(["--gid", &gid.to_string()])
            .arg("--home-dir")
            .arg(home)
            .arg("--create-home")
            .args(["--shell", shell])
            .arg(name);

        let program = "useradd";
        let output = cmd.output().map_err(|source| SessionError::IoError {
            context: format!("spawning {program}"),
            source,
        })?;

        match output.status.code() {
            Some(0) | Some(USERADD_EXISTS) => Ok(()),
            code => Err(SessionError::Provision {
                uid,
                reason: format!(
                    "{program} exited {code:?}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }

    fn delete_user(&self, name: &str) -> Result<(), SessionError> {
        let mut cmd = Command::new("userdel");
        cmd.arg(name);
        Self::run(0, cmd)
    }

    fn recursive_chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), SessionError> {
        let uid = Uid::from_raw(uid);
        let gid = Gid::from_raw(gid);
        for entry in WalkDir::new(path) {
            let entry = entry.map_err(|err| SessionError::IoError {
                context: format!("walking {}", path.display()),
                source: err.into(),
            })?;
            if let Err(err) = chown(entry.path(), Some(uid), Some(gid)) {
                // Ownership of individual entries can fail on odd mounts;
                // keep going and surface the path.
                warn!(path = %entry.path().display(), %err, "chown failed");
            }
        }
        debug!(path = %path.display(), "Recursive chown complete");
        Ok(())
    }
}
