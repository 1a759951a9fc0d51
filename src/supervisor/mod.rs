//! Child process supervision for the guest daemon.
//!
//! The [`Supervisor`] owns the registry of spawned processes, keyed by an
//! opaque `proc-<n>` handle minted from a daemon-global counter. Each spawn
//! starts up to two output forwarders (stderr is folded into the PTY master
//! for terminal-backed children) and one reaper; all three hold only the
//! connection's outbound frame channel, the caller's request id, and their
//! own descriptor. The reaper drains the forwarders before emitting the
//! `exit` frame and removes the record once the child has been waited on.
//!
//! Sandboxed children (`network: false`) are launched through the
//! `sandbox-helper` binary, which rebuilds the command inside a namespace
//! jail. Networked children run the command directly and drop credentials
//! in-process before exec.

mod process;

use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Gid, Pid, Uid, fork};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, instrument, trace, warn};

use crate::error::SpawnError;
use crate::protocol::Frame;
use crate::protocol::message::{
    ExitEvent, MessageType, OutputEvent, RunningStatusReply, SpawnRequest, SpawnedReply,
};

pub use process::{ProcessIo, ProcessRecord, open_pty};

/// Where the isolation helper is installed inside the guest image.
pub const SANDBOX_HELPER_PATH: &str = "/usr/local/bin/sandbox-helper";

/// Outbound frame channel of one connection. Frame writes are serialized by
/// the connection's writer task; any number of tasks may hold a sender.
pub type FrameSender = mpsc::UnboundedSender<Frame>;

/// Registry of live child processes.
#[derive(Debug, Default)]
pub struct Supervisor {
    procs: Mutex<HashMap<String, ProcessRecord>>,
    next_id: AtomicU64,
}

impl Supervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProcessRecord>> {
        // A poisoned registry means a panic while holding the lock; the
        // daemon cannot continue meaningfully past that.
        #[allow(clippy::expect_used)]
        self.procs.lock().expect("process registry poisoned")
    }

    /// Number of live records.
    #[must_use]
    pub fn count(&self) -> usize {
        self.registry().len()
    }

    /// Spawns a child per `req` and registers it.
    ///
    /// Output and exit frames for the child are posted to `out` as
    /// `stdout`/`stderr`/`exit` messages carrying the caller's request id.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if the command is empty or if pipe, PTY, or
    /// fork setup fails. A child that fails to exec exits 127 instead,
    /// surfacing through its `exit` frame.
    #[instrument(skip(self, req, out), fields(id = req.id, command = %req.command, pty = req.pty))]
    pub fn spawn(
        self: Arc<Self>,
        req: &SpawnRequest,
        out: FrameSender,
    ) -> Result<SpawnedReply, SpawnError> {
        if req.command.is_empty() {
            return Err(SpawnError::InvalidCommand(String::from(
                "command cannot be empty",
            )));
        }

        let handle = format!("proc-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let argv = build_argv(req)?;
        let envp = build_envp(req.pty);

        let (record, forwarders) = if req.pty {
            spawn_pty(req, &handle, &argv, &envp)?
        } else {
            spawn_piped(req, &handle, &argv, &envp)?
        };

        let pid = record.pid;
        debug!(%handle, pid = pid.as_raw(), "Spawned child");

        let mut forwarder_tasks = Vec::with_capacity(forwarders.len());
        for (fd, kind) in forwarders {
            let fwd_out = out.clone();
            let id = req.id;
            forwarder_tasks.push(task::spawn_blocking(move || {
                forward_output(fd, kind, id, fwd_out)
            }));
        }

        let reply = SpawnedReply {
            id: req.id,
            pid: pid.as_raw(),
            handle: handle.clone(),
        };

        self.registry().insert(handle.clone(), record);

        let supervisor = Arc::clone(&self);
        let id = req.id;
        tokio::spawn(async move {
            let (code, signal) = task::spawn_blocking(move || reap(pid))
                .await
                .unwrap_or((-1, None));
            // Drain the forwarders so output frames precede the exit frame.
            for task in forwarder_tasks {
                let _ = task.await;
            }
            trace!(%handle, code, "Child reaped");
            let _ = out.send(Frame::json(MessageType::Exit, &ExitEvent { id, code, signal }));
            supervisor.remove(&handle);
        });

        Ok(reply)
    }

    /// Writes `data` to a child's stdin. Unknown handles are ignored.
    pub fn write_stdin(&self, handle: &str, data: &[u8]) {
        let registry = self.registry();
        let Some(record) = registry.get(handle) else {
            trace!(handle, "stdin for unknown handle dropped");
            return;
        };
        if let Err(err) = record.io.write_stdin(data) {
            warn!(handle, %err, "stdin write failed");
        }
    }

    /// Sends `signal` to a child. Unknown handles are ignored.
    pub fn kill(&self, handle: &str, signal: i32) {
        let pid = match self.registry().get(handle) {
            Some(record) => record.pid,
            None => {
                trace!(handle, "kill for unknown handle dropped");
                return;
            }
        };
        let Ok(signal) = Signal::try_from(signal) else {
            warn!(handle, signal, "unknown signal number");
            return;
        };
        if let Err(err) = kill(pid, signal) {
            warn!(handle, %err, "kill failed");
        }
    }

    /// Updates a PTY child's window size; a no-op for pipe-backed children
    /// and unknown handles.
    pub fn resize(&self, handle: &str, rows: u16, cols: u16) {
        let registry = self.registry();
        let Some(record) = registry.get(handle) else {
            return;
        };
        match record.io.resize(rows, cols) {
            Ok(true) => trace!(handle, rows, cols, "Resized terminal"),
            Ok(false) => trace!(handle, "resize on pipe-backed process ignored"),
            Err(err) => warn!(handle, %err, "resize failed"),
        }
    }

    /// Reports whether a child is still alive, via a `kill(pid, 0)` probe.
    #[must_use]
    pub fn status(&self, handle: &str) -> RunningStatusReply {
        let pid = self.registry().get(handle).map(|record| record.pid);
        match pid {
            Some(pid) if kill(pid, None).is_ok() => RunningStatusReply {
                handle: handle.to_string(),
                running: true,
                pid: Some(pid.as_raw()),
            },
            _ => RunningStatusReply {
                handle: handle.to_string(),
                running: false,
                pid: None,
            },
        }
    }

    /// Removes a record, closing its descriptors.
    pub fn remove(&self, handle: &str) {
        if self.registry().remove(handle).is_some() {
            trace!(handle, "Process record removed");
        }
    }
}

/// Builds the child argv, inserting the sandbox-helper prefix for isolated
/// children.
fn build_argv(req: &SpawnRequest) -> Result<Vec<CString>, SpawnError> {
    let mut argv: Vec<String> = Vec::new();

    if !req.network {
        argv.push(String::from(SANDBOX_HELPER_PATH));
        if let Some(uid) = req.uid {
            argv.push(format!("--uid={uid}"));
        }
        if let Some(gid) = req.gid {
            argv.push(format!("--gid={gid}"));
        }
        argv.push(String::from("--no-network"));
        argv.push(format!("--seccomp={}", req.seccomp_profile));
        argv.push(String::from("--"));
    }

    argv.push(req.command.clone());
    argv.extend(req.args.iter().cloned());

    argv.into_iter()
        .map(|arg| {
            CString::new(arg)
                .map_err(|_| SpawnError::InvalidCommand(String::from("embedded NUL in argv")))
        })
        .collect()
}

fn build_envp(pty: bool) -> Vec<CString> {
    let mut envp = vec![
        CString::new("PATH=/usr/local/bin:/usr/bin:/bin").expect("static env"),
        CString::new("HOME=/tmp").expect("static env"),
        CString::new("IS_SANDBOX=yes").expect("static env"),
    ];
    if pty {
        envp.push(CString::new("TERM=xterm-256color").expect("static env"));
    }
    envp
}

type ForwarderPlan = Vec<(OwnedFd, MessageType)>;

/// Forks a pipe-backed child: three anonymous pipes dup'd over the child's
/// standard descriptors.
fn spawn_piped(
    req: &SpawnRequest,
    handle: &str,
    argv: &[CString],
    envp: &[CString],
) -> Result<(ProcessRecord, ForwarderPlan), SpawnError> {
    let pipe = |what| {
        nix::unistd::pipe().map_err(|e| SpawnError::IoSetup {
            what,
            source: std::io::Error::from_raw_os_error(e as i32),
        })
    };
    let (stdin_r, stdin_w) = pipe("stdin pipe")?;
    let (stdout_r, stdout_w) = pipe("stdout pipe")?;
    let (stderr_r, stderr_w) = pipe("stderr pipe")?;

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // Parent ends are of no use to the child.
            close_fd(stdin_w.as_raw_fd());
            close_fd(stdout_r.as_raw_fd());
            close_fd(stderr_r.as_raw_fd());

            dup_over(stdin_r.as_raw_fd(), 0);
            dup_over(stdout_w.as_raw_fd(), 1);
            dup_over(stderr_w.as_raw_fd(), 2);
            close_fd(stdin_r.as_raw_fd());
            close_fd(stdout_w.as_raw_fd());
            close_fd(stderr_w.as_raw_fd());

            exec_child(req, argv, envp)
        }
        Ok(ForkResult::Parent { child }) => {
            drop(stdin_r);
            drop(stdout_w);
            drop(stderr_w);

            let record = ProcessRecord {
                handle: handle.to_string(),
                pid: child,
                request_id: req.id,
                uid: req.uid,
                io: ProcessIo::Pipes { stdin: stdin_w },
            };
            let forwarders = vec![
                (stdout_r, MessageType::Stdout),
                (stderr_r, MessageType::Stderr),
            ];
            Ok((record, forwarders))
        }
        Err(err) => Err(SpawnError::Fork(err.to_string())),
    }
}

/// Forks a PTY-backed child: the slave becomes the controlling terminal and
/// all three standard descriptors; the parent keeps the master.
fn spawn_pty(
    req: &SpawnRequest,
    handle: &str,
    argv: &[CString],
    envp: &[CString],
) -> Result<(ProcessRecord, ForwarderPlan), SpawnError> {
    let (master, slave) = open_pty().map_err(|source| SpawnError::IoSetup {
        what: "pseudo-terminal",
        source,
    })?;

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            close_fd(master.as_raw_fd());
            let _ = nix::unistd::setsid();
            unsafe {
                libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY, 0);
            }
            dup_over(slave.as_raw_fd(), 0);
            dup_over(slave.as_raw_fd(), 1);
            dup_over(slave.as_raw_fd(), 2);
            close_fd(slave.as_raw_fd());

            exec_child(req, argv, envp)
        }
        Ok(ForkResult::Parent { child }) => {
            drop(slave);

            let io = ProcessIo::Pty { master };
            // Stderr is folded into the master; a single forwarder reads a
            // duplicate of it.
            let reader = io
                .dup_output()
                .map_err(|source| SpawnError::IoSetup {
                    what: "pty master duplicate",
                    source,
                })?
                .expect("pty io always has an output duplicate");

            let record = ProcessRecord {
                handle: handle.to_string(),
                pid: child,
                request_id: req.id,
                uid: req.uid,
                io,
            };
            Ok((record, vec![(reader, MessageType::Stdout)]))
        }
        Err(err) => Err(SpawnError::Fork(err.to_string())),
    }
}

/// Final child-side setup and exec. Never returns.
fn exec_child(req: &SpawnRequest, argv: &[CString], envp: &[CString]) -> ! {
    if let Some(cwd) = &req.cwd {
        // Best effort; the command may not care.
        let _ = std::env::set_current_dir(cwd);
    }

    if req.network {
        // No sandbox wrapper: drop credentials here, group first.
        if let Some(gid) = req.gid.or(req.uid) {
            let _ = nix::unistd::setgid(Gid::from_raw(gid));
        }
        if let Some(uid) = req.uid {
            let _ = nix::unistd::setuid(Uid::from_raw(uid));
        }
    }

    let _ = nix::unistd::execvpe(&argv[0], argv, envp);
    unsafe { libc::_exit(127) }
}

fn dup_over(src: i32, dst: i32) {
    unsafe {
        libc::dup2(src, dst);
    }
}

fn close_fd(fd: i32) {
    unsafe {
        libc::close(fd);
    }
}

/// Reads a child's output and posts `stdout`/`stderr` frames until EOF.
fn forward_output(fd: OwnedFd, kind: MessageType, id: u32, out: FrameSender) {
    let mut buf = [0u8; 4096];
    loop {
        match process::read_some(fd.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let event = OutputEvent {
                    id,
                    data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                };
                if out.send(Frame::json(kind, &event)).is_err() {
                    break;
                }
            }
            Err(err) => {
                trace!(%err, "output forwarder stopping");
                break;
            }
        }
    }
}

/// Blocks until the child terminates and decodes its exit status.
fn reap(pid: Pid) -> (i32, Option<i32>) {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return (code, None),
            Ok(WaitStatus::Signaled(_, signal, _)) => return (-1, Some(signal as i32)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                warn!(pid = pid.as_raw(), %err, "waitpid failed");
                return (-1, None);
            }
        }
    }
}
