//! Configuration for the per-process jail.

use std::path::PathBuf;

use crate::sandbox::seccomp::SeccompProfile;

/// A bind mount from a host path to a (possibly different) jail path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Source path on the host side of the mount namespace.
    pub src: PathBuf,
    /// Destination inside the jail. Defaults to `src`.
    pub dest: PathBuf,
}

impl BindMount {
    /// Parses the `SRC[:DEST]` flag syntax.
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        match spec.split_once(':') {
            Some((src, dest)) if !dest.is_empty() => Self {
                src: PathBuf::from(src),
                dest: PathBuf::from(dest),
            },
            _ => Self {
                src: PathBuf::from(spec),
                dest: PathBuf::from(spec),
            },
        }
    }
}

/// Configuration for a sandboxed execution.
///
/// Use the builder methods to customize the jail.
///
/// # Example
///
/// ```
/// use vmsandbox::sandbox::{SandboxSpec, SeccompProfile};
///
/// let spec = SandboxSpec::new()
///     .with_uid(2001)
///     .with_gid(2001)
///     .with_hostname("build-jail")
///     .with_tmpfs("/scratch")
///     .with_seccomp(SeccompProfile::Minimal);
/// ```
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Target uid inside the jail's user namespace.
    pub uid: Option<u32>,

    /// Target gid inside the jail's user namespace.
    pub gid: Option<u32>,

    /// Hostname for the UTS namespace.
    pub hostname: String,

    /// Whether the child shares the host network namespace.
    pub network: bool,

    /// Start the child in a fresh session (`setsid`).
    pub new_session: bool,

    /// Kill the child when the helper's parent dies.
    pub die_with_parent: bool,

    /// Additional read-only binds, in order.
    pub ro_binds: Vec<BindMount>,

    /// Additional read-write binds, in order.
    pub rw_binds: Vec<BindMount>,

    /// Additional tmpfs overlay paths, in order.
    pub tmpfs: Vec<PathBuf>,

    /// Environment variables removed before the standard exports.
    pub env_unset: Vec<String>,

    /// Environment variables set before the standard exports.
    pub env_set: Vec<(String, String)>,

    /// Working directory inside the jail.
    pub cwd: Option<PathBuf>,

    /// Syscall filter profile.
    pub seccomp: SeccompProfile,
}

impl Default for SandboxSpec {
    fn default() -> Self {
        Self {
            uid: None,
            gid: None,
            hostname: String::from("sandbox"),
            network: false,
            new_session: true,
            die_with_parent: true,
            ro_binds: Vec::new(),
            rw_binds: Vec::new(),
            tmpfs: Vec::new(),
            env_unset: Vec::new(),
            env_set: Vec::new(),
            cwd: None,
            seccomp: SeccompProfile::Default,
        }
    }
}

impl SandboxSpec {
    /// Creates a spec with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the uid assumed inside the jail.
    #[must_use]
    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Sets the gid assumed inside the jail.
    #[must_use]
    pub fn with_gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    /// Sets the UTS-namespace hostname.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Enables or disables host network access.
    #[must_use]
    pub fn with_network(mut self, network: bool) -> Self {
        self.network = network;
        self
    }

    /// Adds a read-only bind mount.
    #[must_use]
    pub fn with_ro_bind(mut self, src: impl Into<PathBuf>, dest: Option<PathBuf>) -> Self {
        let src = src.into();
        let dest = dest.unwrap_or_else(|| src.clone());
        self.ro_binds.push(BindMount { src, dest });
        self
    }

    /// Adds a read-write bind mount.
    #[must_use]
    pub fn with_rw_bind(mut self, src: impl Into<PathBuf>, dest: Option<PathBuf>) -> Self {
        let src = src.into();
        let dest = dest.unwrap_or_else(|| src.clone());
        self.rw_binds.push(BindMount { src, dest });
        self
    }

    /// Adds a tmpfs overlay.
    #[must_use]
    pub fn with_tmpfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.tmpfs.push(path.into());
        self
    }

    /// Sets the working directory inside the jail.
    #[must_use]
    pub fn with_cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    /// Sets the seccomp profile.
    #[must_use]
    pub fn with_seccomp(mut self, profile: SeccompProfile) -> Self {
        self.seccomp = profile;
        self
    }
}
