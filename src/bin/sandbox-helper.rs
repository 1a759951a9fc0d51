//! sandbox-helper - per-process isolation wrapper.
//!
//! Invoked by the guest daemon (or by hand) as
//! `sandbox-helper [OPTIONS] -- COMMAND [ARGS...]`. The helper runs twice
//! per jail: the first invocation translates its flags into a bubblewrap
//! command whose target is the helper itself, and the second invocation,
//! now inside the namespaces with the mount plan done, installs the
//! seccomp filter and execs the real command.
//!
//! Exit codes: 1 on argument errors, 127 on exec or seccomp failure; on
//! success the process image is replaced and nothing returns.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use vmsandbox::sandbox::{SandboxSpec, SeccompProfile, seccomp};
use vmsandbox::supervisor::SANDBOX_HELPER_PATH;

/// Run a command inside a namespace jail with a seccomp filter.
#[derive(Parser, Debug)]
#[command(name = "sandbox-helper", author, version, about, long_about = None)]
struct Args {
    /// Uid to assume inside the jail
    #[arg(long, value_name = "U")]
    uid: Option<u32>,

    /// Gid to assume inside the jail
    #[arg(long, value_name = "G")]
    gid: Option<u32>,

    /// Disable network access (unshare the network namespace)
    #[arg(long, conflicts_with = "network")]
    no_network: bool,

    /// Keep host network access
    #[arg(long)]
    network: bool,

    /// Seccomp profile
    #[arg(
        long,
        default_value = "default",
        value_name = "default|nodejs|python|minimal",
        value_parser = parse_profile
    )]
    seccomp: SeccompProfile,

    /// Additional read-only bind mount
    #[arg(long = "ro-bind", value_name = "SRC[:DEST]")]
    ro_bind: Vec<String>,

    /// Additional read-write bind mount
    #[arg(long = "bind", value_name = "SRC[:DEST]")]
    bind: Vec<String>,

    /// Additional tmpfs overlay
    #[arg(long, value_name = "PATH")]
    tmpfs: Vec<PathBuf>,

    /// Working directory inside the jail
    #[arg(long, value_name = "PATH")]
    cwd: Option<PathBuf>,

    /// Second-stage marker: install the seccomp filter and exec. Only
    /// meaningful inside an already-constructed jail.
    #[arg(long, hide = true)]
    seccomp_exec: bool,

    /// Command to run
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn parse_profile(tag: &str) -> Result<SeccompProfile, String> {
    tag.parse().map_err(|e| format!("{e}"))
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            use clap::error::ErrorKind;
            let _ = err.print();
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if args.seccomp_exec {
        run_stage2(&args);
    }
    run_stage1(&args);
}

/// First stage: build the bwrap invocation around a re-exec of ourselves.
fn run_stage1(args: &Args) -> ! {
    let mut spec = SandboxSpec::new()
        .with_hostname("sandbox")
        .with_network(args.network)
        .with_seccomp(args.seccomp);
    if let Some(uid) = args.uid {
        spec = spec.with_uid(uid);
    }
    if let Some(gid) = args.gid {
        spec = spec.with_gid(gid);
    }
    for bind in &args.ro_bind {
        let parsed = vmsandbox::sandbox::BindMount::parse(bind);
        spec = spec.with_ro_bind(parsed.src, Some(parsed.dest));
    }
    for bind in &args.bind {
        let parsed = vmsandbox::sandbox::BindMount::parse(bind);
        spec = spec.with_rw_bind(parsed.src, Some(parsed.dest));
    }
    for path in &args.tmpfs {
        spec = spec.with_tmpfs(path.clone());
    }
    if let Some(cwd) = &args.cwd {
        spec = spec.with_cwd(cwd.clone());
    }

    // The jail target is this binary again, marked for stage two. The
    // helper lives under /usr, which the mount plan binds read-only.
    let self_path = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| String::from(SANDBOX_HELPER_PATH));

    let mut target = vec![
        self_path,
        format!("--seccomp={}", args.seccomp),
        String::from("--seccomp-exec"),
        String::from("--"),
    ];
    target.extend(args.command.iter().cloned());

    let argv = spec.bwrap_argv(&target);
    let err = Command::new(&argv[0]).args(&argv[1..]).exec();
    eprintln!("sandbox-helper: failed to exec bwrap: {err}");
    std::process::exit(127);
}

/// Second stage, inside the jail: NO_NEW_PRIVS, filter, exec.
fn run_stage2(args: &Args) -> ! {
    if let Err(err) = seccomp::apply(args.seccomp) {
        eprintln!("sandbox-helper: {err}");
        std::process::exit(127);
    }

    let err = Command::new(&args.command[0])
        .args(&args.command[1..])
        .exec();
    eprintln!("sandbox-helper: failed to exec {}: {err}", args.command[0]);
    std::process::exit(127);
}
