//! Guest filesystem operations: virtio-fs mounts, binary installs, and
//! bounded file reads.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::FsError;

/// Largest file `read_file` will return, 100 MiB.
pub const MAX_READ_BYTES: u64 = 100 * 1024 * 1024;

/// Default install directory for `install_binary`.
pub const DEFAULT_BIN_DIR: &str = "/usr/local/bin";

/// Mounts a virtio-fs share by tag.
///
/// The mount point is created if missing, then `mount -t virtiofs` runs
/// with `-o ro` when `read_only` is set.
///
/// # Errors
///
/// Returns [`FsError::Mount`] when the directory cannot be created or the
/// mount command exits non-zero.
#[instrument]
pub async fn mount(tag: &str, mount_point: &str, read_only: bool) -> Result<(), FsError> {
    let failed = |reason: String| FsError::Mount {
        tag: tag.to_string(),
        mount_point: mount_point.to_string(),
        reason,
    };

    std::fs::create_dir_all(mount_point).map_err(|e| failed(e.to_string()))?;

    let mut cmd = Command::new("mount");
    cmd.args(["-t", "virtiofs"]);
    if read_only {
        cmd.args(["-o", "ro"]);
    }
    cmd.arg(tag).arg(mount_point);

    let output = cmd.output().await.map_err(|e| failed(e.to_string()))?;
    if !output.status.success() {
        return Err(failed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    debug!(tag, mount_point, read_only, "Mounted virtiofs share");
    Ok(())
}

/// Unmounts a path.
///
/// # Errors
///
/// Returns [`FsError::Unmount`] when `umount` exits non-zero.
#[instrument]
pub async fn unmount(mount_point: &str) -> Result<(), FsError> {
    let output = Command::new("umount")
        .arg(mount_point)
        .output()
        .await
        .map_err(|e| FsError::Unmount {
            mount_point: mount_point.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(FsError::Unmount {
            mount_point: mount_point.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    debug!(mount_point, "Unmounted");
    Ok(())
}

/// Installs a base64-encoded binary under `bin_dir`, truncating any
/// previous file. Mode is 0755 when `executable`, 0644 otherwise.
///
/// # Errors
///
/// Returns [`FsError::InvalidEncoding`] for undecodable payloads and
/// [`FsError::Install`] for write failures.
#[instrument(skip(data))]
pub fn install_binary(
    bin_dir: &Path,
    name: &str,
    data: &str,
    executable: bool,
) -> Result<PathBuf, FsError> {
    let bytes = BASE64
        .decode(data)
        .map_err(|e| FsError::InvalidEncoding {
            reason: e.to_string(),
        })?;

    let path = bin_dir.join(name);
    let install = |source| FsError::Install {
        name: name.to_string(),
        source,
    };

    std::fs::write(&path, bytes).map_err(install)?;

    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(install)?;

    debug!(path = %path.display(), mode = format!("{mode:o}"), "Installed binary");
    Ok(path)
}

/// Reads a file of at most [`MAX_READ_BYTES`] and returns its contents.
///
/// # Errors
///
/// Returns [`FsError::FileTooLarge`] above the limit and [`FsError::Read`]
/// for open or read failures.
#[instrument]
pub fn read_file(path: &str) -> Result<Vec<u8>, FsError> {
    let read_err = |source| FsError::Read {
        path: path.to_string(),
        source,
    };

    let len = std::fs::metadata(path).map_err(read_err)?.len();
    if len > MAX_READ_BYTES {
        warn!(path, len, "refusing oversized read");
        return Err(FsError::FileTooLarge {
            path: path.to_string(),
            len,
            max: MAX_READ_BYTES,
        });
    }

    std::fs::read(path).map_err(read_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_install_executable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let encoded = BASE64.encode(b"#!/bin/sh\necho hi\n");

        let path = install_binary(dir.path(), "hello", &encoded, true)
            .expect("install should succeed");

        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            std::fs::read(&path).expect("read back"),
            b"#!/bin/sh\necho hi\n"
        );
    }

    #[test]
    fn test_install_plain_file_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let encoded = BASE64.encode(b"data");

        let path = install_binary(dir.path(), "blob", &encoded, false)
            .expect("install should succeed");
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_install_truncates_existing() {
        let dir = tempfile::tempdir().expect("tempdir");
        install_binary(dir.path(), "tool", &BASE64.encode(b"first version"), true)
            .expect("first install");
        let path = install_binary(dir.path(), "tool", &BASE64.encode(b"v2"), true)
            .expect("second install");
        assert_eq!(std::fs::read(&path).expect("read back"), b"v2");
    }

    #[test]
    fn test_install_rejects_bad_base64() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = install_binary(dir.path(), "bad", "not base64!!!", true);
        assert!(matches!(result, Err(FsError::InvalidEncoding { .. })));
    }

    #[test]
    fn test_read_file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("x");
        std::fs::write(&path, [1u8, 2, 3]).expect("write");

        let contents = read_file(path.to_str().expect("utf8 path")).expect("read should succeed");
        assert_eq!(contents, vec![1, 2, 3]);
        assert_eq!(BASE64.encode(&contents), "AQID");
    }

    #[test]
    fn test_read_missing_file() {
        let result = read_file("/definitely/not/here");
        assert!(matches!(result, Err(FsError::Read { .. })));
    }
}
