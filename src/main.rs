//! vmd - the guest control daemon.
//!
//! This is the entry point for the daemon binary that runs inside the VM.

use std::sync::Arc;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use vmsandbox::server::{self, DEFAULT_PORT, Daemon};
use vmsandbox::system;

/// Guest control daemon for the per-VM sandboxing harness.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen port. Falls back to $VMD_PORT, then 8080.
    #[arg(long)]
    port: Option<u16>,

    /// Skip runtime requirements checks (NOT RECOMMENDED - sandboxed spawns
    /// may fail at exec time instead)
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

impl Args {
    fn port(&self) -> u16 {
        self.port
            .or_else(|| std::env::var("VMD_PORT").ok()?.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("vmd v{}", env!("CARGO_PKG_VERSION"));

    if args.skip_checks {
        warn!("Skipping runtime requirements checks (--skip-checks).");
        warn!("Sandboxed spawns will fail at exec time if bwrap is missing.");
    } else {
        match system::check_all() {
            Ok(reqs) => {
                info!(
                    "Runtime requirements satisfied: bwrap at {}, ptmx: {}, userns: {}",
                    reqs.bwrap_path.display(),
                    reqs.ptmx,
                    reqs.user_namespaces
                );
            }
            Err(e) => {
                error!("Runtime requirements check failed");
                return Err(e).into_diagnostic();
            }
        }
    }

    let port = args.port();
    let listener = server::bind(port).await.into_diagnostic()?;
    server::run(listener, Arc::new(Daemon::new()))
        .await
        .into_diagnostic()
}
