//! The guest control daemon: accept loop and shared state.

mod connection;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::ServerError;
use crate::fsops;
use crate::session::{SessionRegistry, ShellAccounts};
use crate::supervisor::Supervisor;

/// Port used when `VMD_PORT` is not set.
pub const DEFAULT_PORT: u16 = 8080;

/// Shared daemon state: the process and session registries plus the
/// binary install directory.
pub struct Daemon {
    pub supervisor: Arc<Supervisor>,
    pub sessions: Arc<SessionRegistry>,
    pub bin_dir: PathBuf,
}

impl Daemon {
    /// Creates the production daemon state: shell-based account
    /// provisioning and installs under `/usr/local/bin`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            supervisor: Arc::new(Supervisor::new()),
            sessions: Arc::new(SessionRegistry::new(Box::new(ShellAccounts))),
            bin_dir: PathBuf::from(fsops::DEFAULT_BIN_DIR),
        }
    }

    /// Replaces the session registry (tests inject fake provisioners).
    #[must_use]
    pub fn with_sessions(mut self, sessions: SessionRegistry) -> Self {
        self.sessions = Arc::new(sessions);
        self
    }

    /// Overrides the binary install directory.
    #[must_use]
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = dir.into();
        self
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds the control listener on all interfaces.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] when the port is unavailable.
pub async fn bind(port: u16) -> Result<TcpListener, ServerError> {
    let addr = format!("0.0.0.0:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Runs the accept loop forever, one worker task per connection.
///
/// # Errors
///
/// Returns [`ServerError::Accept`] when accepting fails fatally.
pub async fn run(listener: TcpListener, daemon: Arc<Daemon>) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Control daemon listening");
    }

    loop {
        let (stream, peer) = listener.accept().await.map_err(ServerError::Accept)?;
        debug!(%peer, "Connection accepted");
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            connection::serve(stream, daemon).await;
            debug!(%peer, "Connection closed");
        });
    }
}
