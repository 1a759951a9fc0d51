//! Process records and their I/O endpoints.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::unistd::Pid;

/// I/O endpoints retained by the daemon for one child.
///
/// Pipe-backed children keep only the stdin write end here; the stdout and
/// stderr read ends are owned by their forwarder tasks. PTY-backed children
/// keep the master, which serves stdin, output, and window resizing; the
/// forwarder reads a duplicate so the master itself is closed exactly once,
/// when the record is destroyed.
#[derive(Debug)]
pub enum ProcessIo {
    Pipes { stdin: OwnedFd },
    Pty { master: OwnedFd },
}

impl ProcessIo {
    /// Writes `data` to the child's stdin.
    pub fn write_stdin(&self, data: &[u8]) -> io::Result<()> {
        let fd = match self {
            ProcessIo::Pipes { stdin } => stdin.as_raw_fd(),
            ProcessIo::Pty { master } => master.as_raw_fd(),
        };
        write_all(fd, data)
    }

    /// Updates the terminal window size. Returns `false` for pipe-backed
    /// children, for which resizing is a no-op.
    pub fn resize(&self, rows: u16, cols: u16) -> io::Result<bool> {
        let ProcessIo::Pty { master } = self else {
            return Ok(false);
        };

        let size = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &size) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(true)
    }

    /// Duplicates the descriptor the output forwarder should read.
    pub fn dup_output(&self) -> io::Result<Option<OwnedFd>> {
        match self {
            ProcessIo::Pipes { .. } => Ok(None),
            ProcessIo::Pty { master } => master.try_clone().map(Some),
        }
    }
}

/// One supervised child process.
#[derive(Debug)]
pub struct ProcessRecord {
    /// Opaque handle, `proc-<n>`.
    pub handle: String,
    /// OS process id.
    pub pid: Pid,
    /// Request-correlation id supplied by the caller.
    pub request_id: u32,
    /// Target uid, when the caller asked for one.
    pub uid: Option<u32>,
    /// Retained I/O endpoints. Dropped (and thereby closed) with the record.
    pub io: ProcessIo,
}

/// Opens a pseudo-terminal pair.
///
/// The master comes from `posix_openpt` + `grantpt` + `unlockpt`; the slave
/// is opened read-write by pathname without controlling-terminal semantics
/// (the child claims it as its controlling TTY after `setsid`).
pub fn open_pty() -> io::Result<(OwnedFd, File)> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(to_io)?;
    grantpt(&master).map_err(to_io)?;
    unlockpt(&master).map_err(to_io)?;
    let slave_path = ptsname_r(&master).map_err(to_io)?;

    let slave = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(&slave_path)?;

    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    Ok((master, slave))
}

fn to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Reads up to `buf.len()` bytes from a raw descriptor.
///
/// Returns 0 on EOF. An `EIO` from a PTY master whose slave side is gone is
/// reported as EOF, since that is what it means.
pub fn read_some(fd: i32, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EIO) => return Ok(0),
            _ => return Err(err),
        }
    }
}

fn write_all(fd: i32, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let n = unsafe { libc::write(fd, data.as_ptr().cast::<libc::c_void>(), data.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        data = &data[n as usize..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_pty_pair() {
        let (master, slave) = open_pty().expect("pty allocation should succeed");
        assert!(master.as_raw_fd() >= 0);
        assert!(slave.as_raw_fd() >= 0);
        assert_ne!(master.as_raw_fd(), slave.as_raw_fd());
    }

    #[test]
    fn test_pty_resize() {
        let (master, _slave) = open_pty().expect("pty allocation should succeed");
        let io = ProcessIo::Pty { master };
        let resized = io.resize(40, 120).expect("resize should succeed");
        assert!(resized);
    }

    #[test]
    fn test_pipe_resize_is_noop() {
        let (_r, w) = nix::unistd::pipe().expect("pipe should succeed");
        let io = ProcessIo::Pipes { stdin: w };
        let resized = io.resize(40, 120).expect("resize should be a no-op");
        assert!(!resized);
    }

    #[test]
    fn test_pipe_write_and_read() {
        let (r, w) = nix::unistd::pipe().expect("pipe should succeed");
        let io = ProcessIo::Pipes { stdin: w };
        io.write_stdin(b"abc").expect("write should succeed");
        drop(io);

        let mut buf = [0u8; 16];
        let n = read_some(r.as_raw_fd(), &mut buf).expect("read should succeed");
        assert_eq!(&buf[..n], b"abc");

        // Write end dropped: next read sees EOF.
        let n = read_some(r.as_raw_fd(), &mut buf).expect("read should succeed");
        assert_eq!(n, 0);
    }

    #[test]
    fn test_pty_master_round_trip() {
        use std::io::Write;

        let (master, mut slave) = open_pty().expect("pty allocation should succeed");
        slave.write_all(b"ready\n").expect("slave write");

        let mut buf = [0u8; 64];
        let n = read_some(master.as_raw_fd(), &mut buf).expect("master read");
        assert!(n > 0);
        assert!(buf[..n].starts_with(b"ready"));
    }
}
