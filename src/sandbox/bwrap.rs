//! Translation of a [`SandboxSpec`] into a bubblewrap invocation.

use std::path::Path;

use tracing::trace;

use crate::sandbox::SandboxSpec;

/// System paths offered read-only to every jail, when they exist on the
/// host side of the mount namespace.
const SYSTEM_RO_PATHS: &[&str] = &[
    "/usr",
    "/lib",
    "/lib64",
    "/bin",
    "/sbin",
    "/etc/resolv.conf",
    "/etc/hosts",
    "/etc/passwd",
    "/etc/group",
    "/etc/ssl",
    "/etc/ca-certificates",
];

/// Paths that always get a fresh tmpfs overlay.
const TMPFS_PATHS: &[&str] = &["/tmp", "/run", "/var/tmp"];

/// Standard environment exported into every jail, after the caller policy.
const STANDARD_ENV: &[(&str, &str)] = &[
    ("PATH", "/usr/local/bin:/usr/bin:/bin"),
    ("HOME", "/tmp"),
    ("TERM", "xterm-256color"),
    ("IS_SANDBOX", "yes"),
];

impl SandboxSpec {
    /// Builds the full bwrap argv for executing `target` inside the jail.
    ///
    /// `target` is the command and arguments placed after the `--`
    /// terminator; the caller decides whether that is the real command or a
    /// seccomp-installing re-exec of the helper.
    #[must_use]
    pub fn bwrap_argv(&self, target: &[String]) -> Vec<String> {
        let mut argv: Vec<String> = vec![String::from("bwrap")];

        let arg = |argv: &mut Vec<String>, s: &str| argv.push(s.to_string());

        // Namespace isolation.
        arg(&mut argv, "--unshare-user");
        arg(&mut argv, "--unshare-pid");
        arg(&mut argv, "--unshare-ipc");
        arg(&mut argv, "--unshare-uts");
        arg(&mut argv, "--unshare-cgroup");
        if !self.network {
            arg(&mut argv, "--unshare-net");
        }

        arg(&mut argv, "--hostname");
        argv.push(self.hostname.clone());

        if let Some(uid) = self.uid {
            arg(&mut argv, "--uid");
            argv.push(uid.to_string());
        }
        if let Some(gid) = self.gid {
            arg(&mut argv, "--gid");
            argv.push(gid.to_string());
        }

        // Read-only system overlay, then caller binds in order.
        for path in SYSTEM_RO_PATHS {
            if Path::new(path).exists() {
                arg(&mut argv, "--ro-bind");
                argv.push((*path).to_string());
                argv.push((*path).to_string());
            } else {
                trace!(path, "Skipping missing system path");
            }
        }
        for bind in &self.ro_binds {
            arg(&mut argv, "--ro-bind");
            argv.push(bind.src.display().to_string());
            argv.push(bind.dest.display().to_string());
        }
        for bind in &self.rw_binds {
            arg(&mut argv, "--bind");
            argv.push(bind.src.display().to_string());
            argv.push(bind.dest.display().to_string());
        }

        // Fresh tmpfs overlays.
        for path in TMPFS_PATHS {
            arg(&mut argv, "--tmpfs");
            argv.push((*path).to_string());
        }
        for path in &self.tmpfs {
            arg(&mut argv, "--tmpfs");
            argv.push(path.display().to_string());
        }

        arg(&mut argv, "--proc");
        arg(&mut argv, "/proc");
        arg(&mut argv, "--dev");
        arg(&mut argv, "/dev");

        // Environment policy: unsets, caller sets, then the standard exports.
        for name in &self.env_unset {
            arg(&mut argv, "--unsetenv");
            argv.push(name.clone());
        }
        for (name, value) in &self.env_set {
            arg(&mut argv, "--setenv");
            argv.push(name.clone());
            argv.push(value.clone());
        }
        for (name, value) in STANDARD_ENV {
            arg(&mut argv, "--setenv");
            argv.push((*name).to_string());
            argv.push((*value).to_string());
        }

        if let Some(cwd) = &self.cwd {
            arg(&mut argv, "--chdir");
            argv.push(cwd.display().to_string());
        }

        if self.new_session {
            arg(&mut argv, "--new-session");
        }
        if self.die_with_parent {
            arg(&mut argv, "--die-with-parent");
        }

        arg(&mut argv, "--");
        argv.extend(target.iter().cloned());
        argv
    }
}
