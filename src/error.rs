//! Error types for the sandboxing harness.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use crate::protocol::message as wire;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Runtime requirements not met
    #[error("Runtime requirements check failed")]
    #[diagnostic(code(vmsandbox::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// Wire protocol error
    #[error("Protocol error")]
    #[diagnostic(code(vmsandbox::protocol))]
    Protocol(#[from] ProtocolError),

    /// Control daemon error
    #[error("Daemon error")]
    #[diagnostic(code(vmsandbox::server))]
    Server(#[from] ServerError),

    /// Process spawn error
    #[error("Spawn error")]
    #[diagnostic(code(vmsandbox::spawn))]
    Spawn(#[from] SpawnError),

    /// Session error
    #[error("Session error")]
    #[diagnostic(code(vmsandbox::session))]
    Session(#[from] SessionError),

    /// Filesystem operation error
    #[error("Filesystem operation error")]
    #[diagnostic(code(vmsandbox::fs))]
    Fs(#[from] FsError),

    /// Sandbox construction error
    #[error("Sandbox error")]
    #[diagnostic(code(vmsandbox::sandbox))]
    Sandbox(#[from] SandboxError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(vmsandbox::io))]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The JSON-RPC-style code reported for this error on the wire.
    #[must_use]
    pub fn wire_code(&self) -> i32 {
        match self {
            Error::Protocol(e) => e.wire_code(),
            Error::Spawn(SpawnError::NotFound { .. }) => wire::PROCESS_NOT_FOUND,
            Error::Spawn(_) => wire::SPAWN_FAILED,
            Error::Session(SessionError::Provision { .. }) => wire::USER_CREATE_FAILED,
            Error::Session(_) => wire::INTERNAL_ERROR,
            Error::Fs(FsError::Mount { .. } | FsError::Unmount { .. }) => wire::MOUNT_FAILED,
            Error::Fs(FsError::Install { .. } | FsError::InvalidEncoding { .. }) => {
                wire::INSTALL_FAILED
            }
            Error::Fs(_) => wire::INTERNAL_ERROR,
            _ => wire::INTERNAL_ERROR,
        }
    }
}

/// Errors related to runtime requirements validation on the guest.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// Not running on Linux
    #[error("Operating system {found} is not supported, only Linux is supported")]
    #[diagnostic(code(vmsandbox::system::os))]
    UnsupportedOs { found: String },

    /// bubblewrap binary not found
    #[error("bwrap was not found on PATH")]
    #[diagnostic(
        code(vmsandbox::system::bwrap),
        help("Install bubblewrap inside the guest image (apt install bubblewrap)")
    )]
    BwrapUnavailable,

    /// No pseudo-terminal support
    #[error("/dev/ptmx is not present")]
    #[diagnostic(
        code(vmsandbox::system::ptmx),
        help("Mount devpts in the guest: mount -t devpts devpts /dev/pts")
    )]
    PtmxUnavailable,

    /// Unprivileged user namespaces not enabled
    #[error("Unprivileged user namespaces are not enabled")]
    #[diagnostic(
        code(vmsandbox::system::userns),
        help("Enable with: sysctl -w kernel.unprivileged_userns_clone=1")
    )]
    UserNamespacesDisabled,

    /// Failed to read system information
    #[error("Failed to read system information: {context}")]
    #[diagnostic(code(vmsandbox::system::read_failed))]
    ReadFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced by the frame codec and the WebSocket transport.
#[derive(Error, Debug, Diagnostic)]
pub enum ProtocolError {
    /// Fewer than the 5 header bytes were available
    #[error("Frame too short: {len} bytes")]
    #[diagnostic(code(vmsandbox::protocol::too_short))]
    TooShort { len: usize },

    /// The declared payload length disagrees with the byte count
    #[error("Frame length mismatch: header says {declared}, {actual} bytes present")]
    #[diagnostic(code(vmsandbox::protocol::length_mismatch))]
    LengthMismatch { declared: usize, actual: usize },

    /// Payload exceeds the 16 MiB cap
    #[error("Payload of {len} bytes exceeds the 16 MiB limit")]
    #[diagnostic(code(vmsandbox::protocol::payload_too_large))]
    PayloadTooLarge { len: usize },

    /// WebSocket handshake failed
    #[error("WebSocket handshake failed: {reason}")]
    #[diagnostic(code(vmsandbox::protocol::handshake))]
    Handshake { reason: String },

    /// A payload failed to parse as the expected JSON schema
    #[error("Invalid message payload: {reason}")]
    #[diagnostic(code(vmsandbox::protocol::invalid_payload))]
    InvalidPayload { reason: String },

    /// Transport-level I/O failure
    #[error("Transport I/O error")]
    #[diagnostic(code(vmsandbox::protocol::io))]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// The JSON-RPC-style code reported for this error on the wire.
    #[must_use]
    pub fn wire_code(&self) -> i32 {
        match self {
            ProtocolError::InvalidPayload { .. } => wire::INVALID_PARAMS,
            ProtocolError::TooShort { .. } | ProtocolError::LengthMismatch { .. } => {
                wire::PARSE_ERROR
            }
            _ => wire::INTERNAL_ERROR,
        }
    }
}

/// Errors related to the control daemon.
#[derive(Error, Debug, Diagnostic)]
pub enum ServerError {
    /// Failed to bind the listen socket
    #[error("Failed to bind {addr}")]
    #[diagnostic(code(vmsandbox::server::bind))]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Accept loop failure
    #[error("Failed to accept connection")]
    #[diagnostic(code(vmsandbox::server::accept))]
    Accept(#[source] std::io::Error),
}

/// Errors raised while spawning and supervising child processes.
#[derive(Error, Debug, Diagnostic)]
pub enum SpawnError {
    /// Pipe or PTY allocation failed
    #[error("Failed to allocate {what}: {source}")]
    #[diagnostic(code(vmsandbox::spawn::io_setup))]
    IoSetup {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// fork() failed
    #[error("fork failed: {0}")]
    #[diagnostic(code(vmsandbox::spawn::fork))]
    Fork(String),

    /// The command string was empty or otherwise unusable
    #[error("Invalid command: {0}")]
    #[diagnostic(code(vmsandbox::spawn::invalid_command))]
    InvalidCommand(String),

    /// The target process is not in the registry
    #[error("No such process handle: {handle}")]
    #[diagnostic(code(vmsandbox::spawn::not_found))]
    NotFound { handle: String },
}

/// Errors related to session management and account provisioning.
#[derive(Error, Debug, Diagnostic)]
pub enum SessionError {
    /// The external account provisioner failed
    #[error("Account provisioning failed for uid {uid}: {reason}")]
    #[diagnostic(
        code(vmsandbox::session::provision),
        help("groupadd/useradd must be available inside the guest image")
    )]
    Provision { uid: u32, reason: String },

    /// I/O error during session setup or teardown
    #[error("Session I/O error: {context}")]
    #[diagnostic(code(vmsandbox::session::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by guest filesystem operations.
#[derive(Error, Debug, Diagnostic)]
pub enum FsError {
    /// virtiofs mount failed
    #[error("Failed to mount tag {tag} at {mount_point}: {reason}")]
    #[diagnostic(code(vmsandbox::fs::mount))]
    Mount {
        tag: String,
        mount_point: String,
        reason: String,
    },

    /// Unmount failed
    #[error("Failed to unmount {mount_point}: {reason}")]
    #[diagnostic(code(vmsandbox::fs::unmount))]
    Unmount { mount_point: String, reason: String },

    /// Binary install failed
    #[error("Failed to install binary {name}")]
    #[diagnostic(code(vmsandbox::fs::install))]
    Install {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Base64 payload could not be decoded
    #[error("Invalid base64 payload: {reason}")]
    #[diagnostic(code(vmsandbox::fs::encoding))]
    InvalidEncoding { reason: String },

    /// File too large for a bounded read
    #[error("File {path} is {len} bytes, above the {max} byte read limit")]
    #[diagnostic(code(vmsandbox::fs::too_large))]
    FileTooLarge { path: String, len: u64, max: u64 },

    /// Bounded read failed
    #[error("Failed to read {path}")]
    #[diagnostic(code(vmsandbox::fs::read))]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while constructing the per-process jail.
#[derive(Error, Debug, Diagnostic)]
pub enum SandboxError {
    /// Unknown seccomp profile tag
    #[error("Unknown seccomp profile: {0}")]
    #[diagnostic(code(vmsandbox::sandbox::profile))]
    UnknownProfile(String),

    /// NO_NEW_PRIVS or the filter installation failed
    #[error("Seccomp setup failed: {reason}")]
    #[diagnostic(
        code(vmsandbox::sandbox::seccomp),
        help("The kernel must support seccomp mode 2 (CONFIG_SECCOMP_FILTER=y)")
    )]
    SeccompSetupFailed { reason: String },

    /// The jailed command could not be executed
    #[error("Failed to exec {command}")]
    #[diagnostic(code(vmsandbox::sandbox::exec))]
    ExecFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
