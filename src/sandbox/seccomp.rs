//! Seccomp-BPF filter construction and installation.
//!
//! Filters are classic BPF programs built at runtime from a profile tag:
//! one load of the syscall number, a chain of equality tests, and two
//! terminal returns. Denylist profiles jump to the `ERRNO(EPERM)` return on
//! match and fall through to `ALLOW`; the allowlist profile jumps to
//! `ALLOW` on match and falls through to `ERRNO(EPERM)`. Jump offsets are
//! computed per instruction against the final program length, so the last
//! instruction executed is always one of the two terminal returns.

use std::fmt;
use std::str::FromStr;

use libc::sock_filter;

use crate::error::SandboxError;

// Classic BPF opcodes (linux/filter.h) and seccomp return values
// (linux/seccomp.h), assembled here rather than pulled from bindings.
const LD_ABS_W: u16 = 0x20; // BPF_LD | BPF_W | BPF_ABS
const JEQ_K: u16 = 0x15; // BPF_JMP | BPF_JEQ | BPF_K
const RET_K: u16 = 0x06; // BPF_RET | BPF_K

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_DATA: u32 = 0x0000_ffff;
const SECCOMP_MODE_FILTER: libc::c_ulong = 2;

/// The value returned to denied syscalls: `ERRNO` with `EPERM` data.
pub const RET_EPERM: u32 = SECCOMP_RET_ERRNO | (libc::EPERM as u32 & SECCOMP_RET_DATA);

/// The pass-through return value.
pub const RET_ALLOW: u32 = SECCOMP_RET_ALLOW;

/// Kernel-control syscalls denied by the default profile.
const DEFAULT_DENYLIST: &[libc::c_long] = &[
    libc::SYS_ptrace,
    libc::SYS_process_vm_readv,
    libc::SYS_process_vm_writev,
    libc::SYS_mount,
    libc::SYS_umount2,
    libc::SYS_pivot_root,
    libc::SYS_reboot,
    libc::SYS_swapon,
    libc::SYS_swapoff,
    libc::SYS_init_module,
    libc::SYS_delete_module,
    libc::SYS_finit_module,
    libc::SYS_kexec_load,
    libc::SYS_kexec_file_load,
    libc::SYS_acct,
    libc::SYS_settimeofday,
    libc::SYS_clock_settime,
    libc::SYS_clock_adjtime,
    libc::SYS_adjtimex,
];

/// The only syscalls permitted by the minimal profile.
const MINIMAL_ALLOWLIST: &[libc::c_long] = &[
    libc::SYS_read,
    libc::SYS_write,
    libc::SYS_openat,
    libc::SYS_close,
    libc::SYS_fstat,
    libc::SYS_mmap,
    libc::SYS_mprotect,
    libc::SYS_munmap,
    libc::SYS_brk,
    libc::SYS_exit,
    libc::SYS_exit_group,
    libc::SYS_rt_sigreturn,
    libc::SYS_futex,
];

/// Syscall filter profile selectable per spawned process.
///
/// `nodejs` and `python` carry the same denylist as `default`; the tags are
/// accepted so callers can express intent without tracking which runtimes
/// currently need extra allowances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeccompProfile {
    #[default]
    Default,
    NodeJs,
    Python,
    Minimal,
}

impl SeccompProfile {
    /// The tag used on the wire and on the helper command line.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::NodeJs => "nodejs",
            Self::Python => "python",
            Self::Minimal => "minimal",
        }
    }
}

impl fmt::Display for SeccompProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeccompProfile {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "nodejs" => Ok(Self::NodeJs),
            "python" => Ok(Self::Python),
            "minimal" => Ok(Self::Minimal),
            other => Err(SandboxError::UnknownProfile(other.to_string())),
        }
    }
}

fn stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jeq(k: u32, jt: u8) -> sock_filter {
    sock_filter {
        code: JEQ_K,
        jt,
        jf: 0,
        k,
    }
}

/// Builds the BPF program for `profile`.
///
/// Layout: `LD_ABS[0]`, one `JEQ` per listed syscall, then the
/// `ERRNO(EPERM)` return at `len - 2` and the `ALLOW` return at `len - 1`.
#[must_use]
pub fn build(profile: SeccompProfile) -> Vec<sock_filter> {
    match profile {
        SeccompProfile::Default | SeccompProfile::NodeJs | SeccompProfile::Python => {
            chain(DEFAULT_DENYLIST, JumpTarget::Eperm)
        }
        SeccompProfile::Minimal => chain(MINIMAL_ALLOWLIST, JumpTarget::Allow),
    }
}

enum JumpTarget {
    /// Matching syscalls branch to the EPERM return (denylist).
    Eperm,
    /// Matching syscalls branch to the ALLOW return (allowlist).
    Allow,
}

fn chain(syscalls: &[libc::c_long], target: JumpTarget) -> Vec<sock_filter> {
    let n = syscalls.len();
    let mut prog = Vec::with_capacity(n + 3);

    // Syscall number sits at offset 0 of seccomp_data.
    prog.push(stmt(LD_ABS_W, 0));

    for (i, &nr) in syscalls.iter().enumerate() {
        // Distance from the instruction after this test to the terminal:
        // the EPERM return sits at index n + 1, the ALLOW return at n + 2.
        let jt = match target {
            JumpTarget::Eperm => (n - 1 - i) as u8,
            JumpTarget::Allow => (n - i) as u8,
        };
        prog.push(jeq(nr as u32, jt));
    }

    prog.push(stmt(RET_K, RET_EPERM));
    prog.push(stmt(RET_K, RET_ALLOW));
    prog
}

/// Enables `NO_NEW_PRIVS` and installs `filter` on the calling thread.
///
/// # Errors
///
/// Returns [`SandboxError::SeccompSetupFailed`] if either prctl fails.
/// Callers treat this as fatal and exit before exec.
pub fn install(filter: &[sock_filter]) -> Result<(), SandboxError> {
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1u64, 0u64, 0u64, 0u64) };
    if rc != 0 {
        return Err(SandboxError::SeccompSetupFailed {
            reason: format!("PR_SET_NO_NEW_PRIVS: {}", std::io::Error::last_os_error()),
        });
    }

    let prog = libc::sock_fprog {
        len: filter.len() as libc::c_ushort,
        filter: filter.as_ptr() as *mut sock_filter,
    };
    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            SECCOMP_MODE_FILTER,
            &prog as *const libc::sock_fprog,
            0u64,
            0u64,
        )
    };
    if rc != 0 {
        return Err(SandboxError::SeccompSetupFailed {
            reason: format!("PR_SET_SECCOMP: {}", std::io::Error::last_os_error()),
        });
    }
    Ok(())
}

/// Builds and installs the filter for `profile` in one step.
///
/// # Errors
///
/// See [`install`].
pub fn apply(profile: SeccompProfile) -> Result<(), SandboxError> {
    install(&build(profile))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_terminals(prog: &[sock_filter]) {
        let eperm = &prog[prog.len() - 2];
        let allow = &prog[prog.len() - 1];
        assert_eq!(eperm.code, RET_K);
        assert_eq!(eperm.k, RET_EPERM);
        assert_eq!(allow.code, RET_K);
        assert_eq!(allow.k, RET_ALLOW);
    }

    fn assert_jumps_in_bounds(prog: &[sock_filter]) {
        for (i, inst) in prog.iter().enumerate() {
            if inst.code == JEQ_K {
                assert!(i + 1 + (inst.jt as usize) < prog.len());
                assert!(i + 1 + (inst.jf as usize) < prog.len());
            }
        }
    }

    #[test]
    fn test_default_program_shape() {
        let prog = build(SeccompProfile::Default);
        assert_eq!(prog.len(), DEFAULT_DENYLIST.len() + 3);
        assert_eq!(prog[0].code, LD_ABS_W);
        assert_eq!(prog[0].k, 0);
        assert_terminals(&prog);
        assert_jumps_in_bounds(&prog);
    }

    #[test]
    fn test_default_jumps_target_eperm() {
        let prog = build(SeccompProfile::Default);
        let eperm_index = prog.len() - 2;
        for (i, inst) in prog.iter().enumerate().skip(1).take(DEFAULT_DENYLIST.len()) {
            assert_eq!(
                i + 1 + inst.jt as usize,
                eperm_index,
                "deny check {i} must branch to the EPERM return"
            );
            assert_eq!(inst.jf, 0, "deny check {i} must fall through on mismatch");
        }
        // The last check reaches EPERM by falling through.
        assert_eq!(prog[DEFAULT_DENYLIST.len()].jt, 0);
    }

    #[test]
    fn test_minimal_jumps_target_allow() {
        let prog = build(SeccompProfile::Minimal);
        assert_eq!(prog.len(), MINIMAL_ALLOWLIST.len() + 3);
        assert_terminals(&prog);
        assert_jumps_in_bounds(&prog);

        let allow_index = prog.len() - 1;
        let eperm_index = prog.len() - 2;
        assert_eq!(allow_index, eperm_index + 1);
        for (i, inst) in prog
            .iter()
            .enumerate()
            .skip(1)
            .take(MINIMAL_ALLOWLIST.len())
        {
            assert_eq!(
                i + 1 + inst.jt as usize,
                allow_index,
                "allow check {i} must branch to the ALLOW return"
            );
            assert_eq!(inst.jf, 0);
        }
    }

    #[test]
    fn test_aliases_share_default_list() {
        let default = build(SeccompProfile::Default);
        for profile in [SeccompProfile::NodeJs, SeccompProfile::Python] {
            let prog = build(profile);
            assert_eq!(prog.len(), default.len());
            for (a, b) in prog.iter().zip(default.iter()) {
                assert_eq!((a.code, a.jt, a.jf, a.k), (b.code, b.jt, b.jf, b.k));
            }
        }
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!(
            "default".parse::<SeccompProfile>().expect("should parse"),
            SeccompProfile::Default
        );
        assert_eq!(
            "minimal".parse::<SeccompProfile>().expect("should parse"),
            SeccompProfile::Minimal
        );
        assert!("strict".parse::<SeccompProfile>().is_err());
    }
}
