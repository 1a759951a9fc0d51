//! Per-VM sandboxing harness.
//!
//! This crate provides the control plane for lightweight process sandboxes
//! running inside a dedicated virtual machine: a guest daemon that spawns,
//! supervises, and isolates child processes on behalf of remote callers,
//! the host-side client that drives it, and the namespace/seccomp helper
//! the daemon wraps around sandboxed children.
//!
//! # Architecture
//!
//! - Control connections are WebSockets carrying typed binary frames
//!   ([`protocol`]).
//! - The guest daemon ([`server`]) dispatches each frame to the process
//!   supervisor ([`supervisor`]), the session registry ([`session`]), or
//!   the filesystem operations ([`fsops`]).
//! - Sandboxed children re-exec through `sandbox-helper`, which builds a
//!   bubblewrap namespace jail and installs a seccomp-BPF filter
//!   ([`sandbox`]).
//! - The host client ([`client`]) correlates `spawn` replies and exposes
//!   the remaining traffic as an event stream.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vmsandbox::server::{self, Daemon};
//!
//! #[tokio::main]
//! async fn main() -> miette::Result<()> {
//!     let listener = server::bind(8080).await.map_err(vmsandbox::error::Error::from)?;
//!     server::run(listener, Arc::new(Daemon::new()))
//!         .await
//!         .map_err(vmsandbox::error::Error::from)?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod fsops;
pub mod protocol;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod system;

// Re-export commonly used types
pub use client::{ClientEvent, VmClient};
pub use error::{Error, Result};
pub use sandbox::{SandboxSpec, SeccompProfile};
pub use server::Daemon;
pub use supervisor::Supervisor;
