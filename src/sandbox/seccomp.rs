//! Seccomp filters for execution units.
//!
//! [`NetworkFilter`] removes network access. [`WriteFilter`] makes the whole
//! filesystem read-only and stands in for Landlock on kernels without it.
//! Programs are assembled in the parent before `fork`; `install` only
//! issues `prctl` and `seccomp` so it is safe to call from `pre_exec`.

use std::io;
use std::os::raw::{c_uchar, c_uint, c_ulong, c_ushort};

const EPERM: c_uint = 1;
const EACCES: c_uint = 13;
const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;
const SECCOMP_SET_MODE_FILTER: c_uint = 1;
const SECCOMP_RET_ALLOW: c_uint = 0x7fff_0000;
const SECCOMP_RET_ERRNO: c_uint = 0x0005_0000;
const SECCOMP_RET_KILL_PROCESS: c_uint = 0x8000_0000;
const AUDIT_ARCH_X86_64: c_uint = 0xc000_003e;
const X32_SYSCALL_BIT: c_uint = 0x4000_0000;

const BPF_LD: c_ushort = 0x00;
const BPF_W: c_ushort = 0x00;
const BPF_ABS: c_ushort = 0x20;
const BPF_JMP: c_ushort = 0x05;
const BPF_JEQ: c_ushort = 0x10;
const BPF_JGE: c_ushort = 0x30;
const BPF_JSET: c_ushort = 0x40;
const BPF_K: c_ushort = 0x00;
const BPF_RET: c_ushort = 0x06;

const SYSCALL_NR_OFFSET: c_uint = 0;
const ARCH_OFFSET: c_uint = 4;
const ARGS_OFFSET: c_uint = 16;

const SYS_SOCKET: c_uint = 41;
const SYS_CONNECT: c_uint = 42;
const SYS_ACCEPT: c_uint = 43;
const SYS_SENDTO: c_uint = 44;
const SYS_RECVFROM: c_uint = 45;
const SYS_SENDMSG: c_uint = 46;
const SYS_RECVMSG: c_uint = 47;
const SYS_SHUTDOWN: c_uint = 48;
const SYS_BIND: c_uint = 49;
const SYS_LISTEN: c_uint = 50;
const SYS_GETSOCKNAME: c_uint = 51;
const SYS_GETPEERNAME: c_uint = 52;
const SYS_SOCKETPAIR: c_uint = 53;
const SYS_SETSOCKOPT: c_uint = 54;
const SYS_GETSOCKOPT: c_uint = 55;
const SYS_ACCEPT4: c_uint = 288;
const SYS_RECVMMSG: c_uint = 299;
const SYS_SENDMMSG: c_uint = 307;

const DENIED_SYSCALLS: [c_uint; 18] = [
    SYS_SOCKET,
    SYS_CONNECT,
    SYS_ACCEPT,
    SYS_SENDTO,
    SYS_RECVFROM,
    SYS_SENDMSG,
    SYS_RECVMSG,
    SYS_SHUTDOWN,
    SYS_BIND,
    SYS_LISTEN,
    SYS_GETSOCKNAME,
    SYS_GETPEERNAME,
    SYS_SOCKETPAIR,
    SYS_SETSOCKOPT,
    SYS_GETSOCKOPT,
    SYS_ACCEPT4,
    SYS_RECVMMSG,
    SYS_SENDMMSG,
];

const SYS_OPEN: c_uint = 2;
const SYS_OPENAT: c_uint = 257;
const SYS_OPENAT2: c_uint = 437;

/// O_WRONLY | O_RDWR | O_CREAT | O_TRUNC | O_APPEND.
const WRITE_OPEN_FLAGS: c_uint = 0o1 | 0o2 | 0o100 | 0o1000 | 0o2000;

/// Calls that change the filesystem whatever their arguments. `openat2`
/// hides its flags behind a pointer, so it goes here too.
const MUTATING_SYSCALLS: [c_uint; 25] = [
    SYS_OPENAT2,
    85,  // creat
    87,  // unlink
    263, // unlinkat
    82,  // rename
    264, // renameat
    316, // renameat2
    83,  // mkdir
    258, // mkdirat
    84,  // rmdir
    86,  // link
    265, // linkat
    88,  // symlink
    266, // symlinkat
    76,  // truncate
    77,  // ftruncate
    90,  // chmod
    91,  // fchmod
    268, // fchmodat
    92,  // chown
    93,  // fchown
    94,  // lchown
    260, // fchownat
    133, // mknod
    259, // mknodat
];

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SockFilter {
    code: c_ushort,
    jt: c_uchar,
    jf: c_uchar,
    k: c_uint,
}

#[repr(C)]
struct SockFprog {
    len: c_ushort,
    filter: *const SockFilter,
}

fn stmt(code: c_ushort, k: c_uint) -> SockFilter {
    SockFilter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(code: c_ushort, k: c_uint, jt: c_uchar, jf: c_uchar) -> SockFilter {
    SockFilter { code, jt, jf, k }
}

fn arg_offset(index: c_uint) -> c_uint {
    ARGS_OFFSET + 8 * index
}

/// Kills foreign-architecture callers, then loads the syscall number.
fn prologue() -> Vec<SockFilter> {
    vec![
        // Foreign architectures would reinterpret syscall numbers.
        stmt(BPF_LD | BPF_W | BPF_ABS, ARCH_OFFSET),
        jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_X86_64, 1, 0),
        stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS),
        stmt(BPF_LD | BPF_W | BPF_ABS, SYSCALL_NR_OFFSET),
    ]
}

/// Sets `no_new_privs` and installs `program` on the calling thread.
///
/// # Safety
///
/// Meant for a freshly forked child in `pre_exec`: it must not allocate,
/// and the filter applies to everything the process runs afterwards.
unsafe fn install_program(program: &[SockFilter]) -> io::Result<()> {
    if libc::prctl(PR_SET_NO_NEW_PRIVS, 1 as c_ulong, 0 as c_ulong, 0 as c_ulong, 0 as c_ulong)
        != 0
    {
        return Err(io::Error::last_os_error());
    }
    let prog = SockFprog {
        len: program.len() as c_ushort,
        filter: program.as_ptr(),
    };
    let rc = libc::syscall(
        libc::SYS_seccomp,
        SECCOMP_SET_MODE_FILTER,
        0 as c_uint,
        &prog as *const SockFprog,
    );
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct NetworkFilter {
    program: Vec<SockFilter>,
}

impl NetworkFilter {
    pub fn new() -> Self {
        let deny_errno = SECCOMP_RET_ERRNO | EPERM;
        let mut program = prologue();
        // x32 ABI aliases of the socket calls.
        program.push(jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 0, 1));
        program.push(stmt(BPF_RET | BPF_K, deny_errno));
        for syscall in DENIED_SYSCALLS {
            program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, syscall, 0, 1));
            program.push(stmt(BPF_RET | BPF_K, deny_errno));
        }
        program.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
        Self { program }
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    /// Sets `no_new_privs` and installs the filter on the calling thread.
    ///
    /// # Safety
    ///
    /// Meant for a freshly forked child in `pre_exec`: it must not allocate,
    /// and the filter applies to everything the process runs afterwards.
    pub unsafe fn install(&self) -> io::Result<()> {
        install_program(&self.program)
    }
}

impl Default for NetworkFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Denies every filesystem write with `EACCES`: opens asking for write
/// access, creation or truncation, and the calls in [`MUTATING_SYSCALLS`].
#[derive(Clone, Debug)]
pub struct WriteFilter {
    program: Vec<SockFilter>,
}

impl WriteFilter {
    pub fn new() -> Self {
        let deny = stmt(BPF_RET | BPF_K, SECCOMP_RET_ERRNO | EACCES);
        let mut program = prologue();
        // Flags are the second argument of open and the third of openat.
        for (syscall, flags_arg) in [(SYS_OPEN, 1), (SYS_OPENAT, 2)] {
            program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, syscall, 0, 3));
            program.push(stmt(BPF_LD | BPF_W | BPF_ABS, arg_offset(flags_arg)));
            program.push(jump(BPF_JMP | BPF_JSET | BPF_K, WRITE_OPEN_FLAGS, 0, 1));
            program.push(deny);
            program.push(stmt(BPF_LD | BPF_W | BPF_ABS, SYSCALL_NR_OFFSET));
        }
        for syscall in MUTATING_SYSCALLS {
            program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, syscall, 0, 1));
            program.push(deny);
        }
        program.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
        Self { program }
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    /// Installs the filter like [`NetworkFilter::install`].
    ///
    /// # Safety
    ///
    /// Same contract as [`NetworkFilter::install`].
    pub unsafe fn install(&self) -> io::Result<()> {
        install_program(&self.program)
    }
}

impl Default for WriteFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    #[test]
    fn program_ends_with_allow_and_denies_every_socket_call() {
        let filter = NetworkFilter::new();
        assert_eq!(filter.len(), 6 + 2 * DENIED_SYSCALLS.len() + 1);
        assert_eq!(
            filter.program.last(),
            Some(&stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW))
        );
        for syscall in DENIED_SYSCALLS {
            assert!(filter
                .program
                .iter()
                .any(|insn| insn.code == BPF_JMP | BPF_JEQ | BPF_K && insn.k == syscall));
        }
    }

    #[test]
    fn child_cannot_open_sockets() -> anyhow::Result<()> {
        if Command::new("python3").arg("-c").arg("0").output().is_err() {
            eprintln!("python3 not available; skipping");
            return Ok(());
        }
        let filter = NetworkFilter::new();
        let mut command = Command::new("python3");
        command.arg("-c").arg(
            "import socket, sys\ntry:\n    socket.socket()\nexcept PermissionError:\n    sys.exit(7)\nsys.exit(0)",
        );
        unsafe {
            command.pre_exec(move || filter.install());
        }
        let status = command.status()?;
        assert_eq!(status.code(), Some(7));
        Ok(())
    }

    #[test]
    fn write_filter_checks_open_flags_then_mutating_calls() {
        let filter = WriteFilter::new();
        assert_eq!(filter.len(), 4 + 2 * 5 + 2 * MUTATING_SYSCALLS.len() + 1);
        let flag_checks = filter
            .program
            .iter()
            .filter(|insn| insn.code == BPF_JMP | BPF_JSET | BPF_K)
            .count();
        assert_eq!(flag_checks, 2);
        assert!(filter
            .program
            .iter()
            .any(|insn| insn.code == BPF_LD | BPF_W | BPF_ABS && insn.k == arg_offset(2)));
    }

    #[test]
    fn write_filter_denies_writes_but_not_reads() -> anyhow::Result<()> {
        let outside = tempfile::tempdir()?;
        let target = outside.path().join("planted.bin");
        let filter = WriteFilter::new();
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg("read line < /etc/passwd || exit 8; echo pwned > \"$1\" || exit 9; exit 0")
            .arg("sh")
            .arg(&target);
        unsafe {
            command.pre_exec(move || filter.install());
        }
        let status = command.status()?;
        assert_eq!(status.code(), Some(9));
        assert!(!target.exists());
        Ok(())
    }
}
