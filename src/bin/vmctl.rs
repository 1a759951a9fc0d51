//! vmctl - host-side controller CLI.
//!
//! Speaks the control protocol to a guest daemon reachable through a
//! forwarded port on localhost. The VM lifecycle subcommands (start, stop,
//! the web terminal) belong to the hypervisor tooling; this binary covers
//! the protocol-speaking operations.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, miette};
use tokio::io::AsyncReadExt;
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, fmt};

use vmsandbox::client::{ClientEvent, VmClient};

/// Host-side controller for the per-VM sandboxing harness.
#[derive(Parser, Debug)]
#[command(name = "vmctl", author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a command in the guest and stream its output
    Exec {
        /// Forwarded daemon port on localhost
        port: u16,

        /// Bypass the sandbox and keep network access
        #[arg(long)]
        raw: bool,

        /// Attach a pseudo-terminal
        #[arg(long)]
        pty: bool,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Install a file into the guest's /usr/local/bin
    Install {
        /// Forwarded daemon port on localhost
        port: u16,

        /// File to install; the guest name is its basename
        file: PathBuf,
    },

    /// Check that the daemon answers
    Ping {
        /// Forwarded daemon port on localhost
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env()
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Exec {
            port,
            raw,
            pty,
            command,
        } => exec(port, raw, pty, command).await,
        Commands::Install { port, file } => install(port, file).await,
        Commands::Ping { port } => ping(port).await,
    }
}

async fn connect(port: u16) -> Result<VmClient> {
    VmClient::connect("127.0.0.1", port)
        .await
        .into_diagnostic()
}

/// Runs a command in the guest, forwarding stdin and propagating the exit
/// code. Never returns on success: the process exits with the child's code.
async fn exec(port: u16, raw: bool, pty: bool, command: Vec<String>) -> Result<()> {
    let mut client = connect(port).await?;
    let mut events = client
        .take_events()
        .ok_or_else(|| miette!("event stream already taken"))?;
    let client = Arc::new(client);

    let (cmd, args) = command.split_first().expect("clap requires a command");
    let spawned = if pty {
        client.spawn_pty(cmd, args, raw).await
    } else if raw {
        client.spawn_raw(cmd, args).await
    } else {
        client.spawn(cmd, args).await
    }
    .into_diagnostic()?;
    debug!(handle = %spawned.handle, pid = spawned.pid, "Spawned");

    // Forward our stdin to the child until EOF.
    let stdin_client = Arc::clone(&client);
    let handle = spawned.handle.clone();
    let id = spawned.id;
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if stdin_client.send_stdin(id, &handle, &chunk).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Stdout { id, data } if id == spawned.id => {
                print!("{data}");
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
            ClientEvent::Stderr { id, data } if id == spawned.id => {
                eprint!("{data}");
            }
            ClientEvent::Exit { id, code, .. } if id == spawned.id => {
                std::process::exit(if code < 0 { 1 } else { code });
            }
            ClientEvent::Error { id, message, .. } if id == spawned.id => {
                eprintln!("vmctl: {message}");
                std::process::exit(1);
            }
            _ => {}
        }
    }

    Err(miette!("connection closed before the child exited"))
}

async fn install(port: u16, file: PathBuf) -> Result<()> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| miette!("{} has no usable file name", file.display()))?
        .to_string();
    let contents = std::fs::read(&file).into_diagnostic()?;

    let client = connect(port).await?;
    client
        .install(&name, &contents, true)
        .await
        .into_diagnostic()?;
    println!("installed {name} ({} bytes)", contents.len());
    client.close().await;
    Ok(())
}

async fn ping(port: u16) -> Result<()> {
    let client = connect(port).await?;
    client.ping().await.into_diagnostic()?;
    println!("pong");
    client.close().await;
    Ok(())
}
