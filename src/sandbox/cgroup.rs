//! Per-unit cgroup v2 scopes for the process backend.
//!
//! The operator delegates a parent directory; each unit gets its own child
//! scope with `pids.max` (and `memory.max`/`cpu.max` when those controllers
//! are enabled). The child joins the scope from `pre_exec`, so every process
//! it forks is counted against the unit alone and not against the gateway's
//! UID.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::backend::UnitLimits;
use super::SandboxError;

const CPU_PERIOD_US: u64 = 100_000;
const MIN_CPU_QUOTA_US: u64 = 1_000;
const REMOVE_ATTEMPTS: usize = 50;
const REMOVE_BACKOFF: Duration = Duration::from_millis(10);

/// `true` if `path` is a directory of a cgroup v2 hierarchy.
pub fn is_cgroup_v2_dir(path: &Path) -> bool {
    path.join("cgroup.controllers").exists()
}

/// Creates `<parent>/<name>` and writes the unit's limits into it.
pub fn create_unit_scope(
    parent: &Path,
    name: &str,
    limits: &UnitLimits,
) -> Result<PathBuf, SandboxError> {
    if !is_cgroup_v2_dir(parent) {
        return Err(SandboxError::Backend(format!(
            "{} is not a cgroup v2 directory",
            parent.display()
        )));
    }
    enable_controllers(parent);
    let scope = parent.join(name);
    fs::create_dir(&scope).map_err(|err| {
        SandboxError::Backend(format!("failed to create cgroup {}: {err}", scope.display()))
    })?;
    if let Err(err) = apply_limits(&scope, limits) {
        remove_scope(&scope);
        return Err(err);
    }
    Ok(scope)
}

/// `pids.max` is mandatory; memory and cpu limits are written only when the
/// controller is enabled for the scope.
pub fn apply_limits(scope: &Path, limits: &UnitLimits) -> Result<(), SandboxError> {
    let pids_max = scope.join("pids.max");
    if !pids_max.exists() {
        return Err(SandboxError::Backend(format!(
            "pids controller is not enabled for {}",
            scope.display()
        )));
    }
    write_limit(&pids_max, &limits.pids.to_string())?;

    let memory_max = scope.join("memory.max");
    if memory_max.exists() {
        write_limit(&memory_max, &limits.memory_bytes.to_string())?;
    }
    let cpu_max = scope.join("cpu.max");
    if cpu_max.exists() {
        let quota = ((limits.cpus * CPU_PERIOD_US as f64).ceil() as u64).max(MIN_CPU_QUOTA_US);
        write_limit(&cpu_max, &format!("{quota} {CPU_PERIOD_US}"))?;
    }
    Ok(())
}

/// Opened by the parent; the child joins through it before exec.
pub fn procs_file(scope: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .open(scope.join("cgroup.procs"))
}

/// Moves the calling process into the scope behind `procs_fd`.
///
/// # Safety
///
/// Only issues `write(2)`; meant for `pre_exec`.
pub unsafe fn join_scope(procs_fd: RawFd) -> io::Result<()> {
    let pid = b"0\n";
    if libc::write(procs_fd, pid.as_ptr().cast(), pid.len()) < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Kills every process in the scope, including ones that left the unit's
/// process group. Needs `cgroup.kill` (Linux 5.14).
pub fn kill_scope(scope: &Path) {
    let kill = scope.join("cgroup.kill");
    if !kill.exists() {
        return;
    }
    if let Err(err) = fs::write(&kill, "1") {
        if err.kind() != io::ErrorKind::NotFound {
            log::warn!("failed to kill cgroup {}: {err}", scope.display());
        }
    }
}

/// Removes the scope once its processes are reaped. The kernel refuses with
/// EBUSY while any remain, so this retries briefly.
pub fn remove_scope(scope: &Path) {
    for _ in 0..REMOVE_ATTEMPTS {
        match fs::remove_dir(scope) {
            Ok(()) => return,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return,
            Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
                std::thread::sleep(REMOVE_BACKOFF);
            }
            Err(err) => {
                log::warn!("failed to remove cgroup {}: {err}", scope.display());
                return;
            }
        }
    }
    log::warn!("cgroup {} still busy; leaving it behind", scope.display());
}

fn enable_controllers(parent: &Path) {
    let subtree_control = parent.join("cgroup.subtree_control");
    if subtree_control.exists() {
        // Controllers the parent lacks are simply not enabled.
        let _ = fs::write(&subtree_control, "+pids +memory +cpu");
    }
}

fn write_limit(path: &Path, value: &str) -> Result<(), SandboxError> {
    fs::write(path, format!("{value}\n"))
        .map_err(|err| SandboxError::Backend(format!("failed to set {}: {err}", path.display())))
}
