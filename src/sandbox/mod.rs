//! Per-process isolation: namespace jail construction and seccomp filtering.
//!
//! The supervisor launches sandboxed children through the `sandbox-helper`
//! binary, which translates a [`SandboxSpec`] into a bubblewrap invocation:
//! user/PID/IPC/UTS/cgroup namespaces (plus net when networking is
//! disabled), a read-only overlay of the system paths, tmpfs overlays, and
//! an environment policy. Seccomp filtering happens inside the jail: the
//! helper re-execs itself after bwrap's mount plan so the filter is the
//! last thing installed before the target command runs.
//!
//! # Example
//!
//! ```no_run
//! use vmsandbox::sandbox::{SandboxSpec, SeccompProfile};
//!
//! let spec = SandboxSpec::new()
//!     .with_uid(1000)
//!     .with_network(false)
//!     .with_seccomp(SeccompProfile::Default)
//!     .with_ro_bind("/opt/tools", None);
//!
//! let argv = spec.bwrap_argv(&["/bin/echo".into(), "hi".into()]);
//! assert_eq!(argv[0], "bwrap");
//! ```

mod bwrap;
mod config;
pub mod seccomp;

pub use config::{BindMount, SandboxSpec};
pub use seccomp::SeccompProfile;
