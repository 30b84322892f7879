//! Landlock ruleset that makes the filesystem read-only for a unit except
//! beneath its work directory.
//!
//! Only write-type rights are handled, so reading and executing anywhere
//! stays governed by ordinary permissions. The ruleset is built in the
//! parent; the child only calls `landlock_restrict_self` from `pre_exec`.

use std::fs::OpenOptions;
use std::io;
use std::mem::size_of;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

const SYS_LANDLOCK_CREATE_RULESET: libc::c_long = 444;
const SYS_LANDLOCK_ADD_RULE: libc::c_long = 445;
const SYS_LANDLOCK_RESTRICT_SELF: libc::c_long = 446;
const LANDLOCK_CREATE_RULESET_VERSION: libc::c_uint = 1;
const LANDLOCK_RULE_PATH_BENEATH: libc::c_uint = 1;

const ACCESS_FS_WRITE_FILE: u64 = 1 << 1;
const ACCESS_FS_REMOVE_DIR: u64 = 1 << 4;
const ACCESS_FS_REMOVE_FILE: u64 = 1 << 5;
const ACCESS_FS_MAKE_CHAR: u64 = 1 << 6;
const ACCESS_FS_MAKE_DIR: u64 = 1 << 7;
const ACCESS_FS_MAKE_REG: u64 = 1 << 8;
const ACCESS_FS_MAKE_SOCK: u64 = 1 << 9;
const ACCESS_FS_MAKE_FIFO: u64 = 1 << 10;
const ACCESS_FS_MAKE_BLOCK: u64 = 1 << 11;
const ACCESS_FS_MAKE_SYM: u64 = 1 << 12;
const ACCESS_FS_REFER: u64 = 1 << 13;
const ACCESS_FS_TRUNCATE: u64 = 1 << 14;

const WRITE_ACCESS_V1: u64 = ACCESS_FS_WRITE_FILE
    | ACCESS_FS_REMOVE_DIR
    | ACCESS_FS_REMOVE_FILE
    | ACCESS_FS_MAKE_CHAR
    | ACCESS_FS_MAKE_DIR
    | ACCESS_FS_MAKE_REG
    | ACCESS_FS_MAKE_SOCK
    | ACCESS_FS_MAKE_FIFO
    | ACCESS_FS_MAKE_BLOCK
    | ACCESS_FS_MAKE_SYM;

/// Writable outside the work dir; shells redirect to it all the time.
const DEV_NULL: &str = "/dev/null";

#[repr(C)]
struct RulesetAttr {
    handled_access_fs: u64,
}

#[repr(C, packed)]
struct PathBeneathAttr {
    allowed_access: u64,
    parent_fd: i32,
}

/// Landlock ABI version of the running kernel, `None` when unsupported or
/// disabled.
pub fn abi_version() -> Option<i32> {
    let rc = unsafe {
        libc::syscall(
            SYS_LANDLOCK_CREATE_RULESET,
            std::ptr::null::<RulesetAttr>(),
            0usize,
            LANDLOCK_CREATE_RULESET_VERSION,
        )
    };
    (rc > 0).then_some(rc as i32)
}

/// Write rights the ruleset handles on a kernel speaking `abi`.
fn handled_access(abi: i32) -> u64 {
    let mut access = WRITE_ACCESS_V1;
    if abi >= 2 {
        access |= ACCESS_FS_REFER;
    }
    if abi >= 3 {
        access |= ACCESS_FS_TRUNCATE;
    }
    access
}

/// Rights a rule on a regular file may grant.
fn file_access(handled: u64) -> u64 {
    handled & (ACCESS_FS_WRITE_FILE | ACCESS_FS_TRUNCATE)
}

#[derive(Debug)]
pub struct WriteRuleset {
    fd: OwnedFd,
}

impl WriteRuleset {
    /// Builds the ruleset for one unit. `Ok(None)` means the kernel has no
    /// Landlock and the caller must fall back to something else.
    pub fn for_work_dir(work_dir: &Path) -> io::Result<Option<Self>> {
        let Some(abi) = abi_version() else {
            return Ok(None);
        };
        let handled = handled_access(abi);
        let attr = RulesetAttr {
            handled_access_fs: handled,
        };
        let rc = unsafe {
            libc::syscall(
                SYS_LANDLOCK_CREATE_RULESET,
                &attr as *const RulesetAttr,
                size_of::<RulesetAttr>(),
                0 as libc::c_uint,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // The kernel returns the ruleset fd with O_CLOEXEC set.
        let ruleset = Self {
            fd: unsafe { OwnedFd::from_raw_fd(rc as libc::c_int) },
        };
        ruleset.allow_beneath(work_dir, handled)?;
        if Path::new(DEV_NULL).exists() {
            ruleset.allow_beneath(Path::new(DEV_NULL), file_access(handled))?;
        }
        Ok(Some(ruleset))
    }

    fn allow_beneath(&self, path: &Path, access: u64) -> io::Result<()> {
        let target = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_PATH | libc::O_CLOEXEC)
            .open(path)?;
        let rule = PathBeneathAttr {
            allowed_access: access,
            parent_fd: target.as_raw_fd(),
        };
        let rc = unsafe {
            libc::syscall(
                SYS_LANDLOCK_ADD_RULE,
                self.fd.as_raw_fd(),
                LANDLOCK_RULE_PATH_BENEATH,
                &rule as *const PathBeneathAttr,
                0 as libc::c_uint,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(io::Error::new(
                err.kind(),
                format!("landlock rule for {}: {err}", path.display()),
            ));
        }
        Ok(())
    }

    /// Enforces the ruleset on the calling process and everything it execs.
    ///
    /// # Safety
    ///
    /// Meant for `pre_exec` after `no_new_privs` is set; only issues one
    /// syscall.
    pub unsafe fn restrict_self(&self) -> io::Result<()> {
        if libc::syscall(
            SYS_LANDLOCK_RESTRICT_SELF,
            self.fd.as_raw_fd(),
            0 as libc::c_uint,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
