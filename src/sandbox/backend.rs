//! Isolation backends.
//!
//! A backend turns a [`UnitSpec`] into a running child whose stdout and
//! stderr are pipes, plus a [`UnitHandle`] that can kill and remove the
//! whole unit later.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use super::SandboxError;

/// Environment variables passed through from a fixed allowlist.
const PASSTHROUGH_ENV: [&str; 3] = ["LANG", "LC_ALL", "TZ"];
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const CONTAINER_SCRIPT_DIR: &str = "/sandbox";
const CONTAINER_WORK_DIR: &str = "/work";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entrypoint {
    /// Run `script` (file name inside the script dir) with the interpreter.
    Python { script: String },
    /// `/bin/sh -c <command>`.
    Shell { command: String },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnitLimits {
    pub memory_bytes: u64,
    pub cpus: f64,
    pub cpu_seconds: u64,
    pub pids: u64,
}

impl UnitLimits {
    /// RLIMIT_CPU backstop for the process backend. The wall-clock deadline
    /// ends runs; this only catches a unit that outlives it, so one busy
    /// thread must never reach it first: `ceil(timeout * max(cpus, 1)) + 1`.
    pub fn cpu_seconds_for(timeout: Duration, cpus: f64) -> u64 {
        (timeout.as_secs_f64() * cpus.max(1.0)).ceil() as u64 + 1
    }
}

#[derive(Debug)]
pub struct UnitSpec<'a> {
    pub entrypoint: &'a Entrypoint,
    pub script_dir: &'a Path,
    pub work_dir: &'a Path,
    pub environment: &'a BTreeMap<String, String>,
    pub limits: UnitLimits,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitHandle {
    /// Session/process group led by `pgid`, optionally inside its own cgroup.
    ProcessGroup { pgid: u32, cgroup: Option<PathBuf> },
    Container { id: String },
}

#[derive(Debug)]
pub struct LaunchedUnit {
    pub child: Child,
    pub handle: UnitHandle,
}

pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn launch(&self, spec: &UnitSpec<'_>) -> Result<LaunchedUnit, SandboxError>;

    /// Kills every process of the unit. Must tolerate an already dead unit.
    fn terminate(&self, handle: &UnitHandle);

    /// Releases whatever the unit still holds (container, cgroup).
    fn destroy(&self, handle: &UnitHandle);

    /// Readiness check.
    fn check(&self) -> Result<(), SandboxError>;
}

fn base_environment(user_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), SANDBOX_PATH.to_string());
    env.insert("HOME".to_string(), CONTAINER_WORK_DIR.to_string());
    env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
    for key in PASSTHROUGH_ENV {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_string(), value);
        }
    }
    for (key, value) in user_env {
        env.insert(key.clone(), value.clone());
    }
    env
}

// -------------------- Process backend --------------------

/// Runs the unit as a child process in its own session with rlimits and no
/// new privileges. Seccomp denies sockets; Landlock (or a seccomp write
/// filter where Landlock is missing) keeps the filesystem read-only outside
/// the work dir. With a cgroup parent configured, each unit also gets its
/// own scope carrying the pids limit. Linux x86_64 only.
#[derive(Clone, Debug)]
pub struct ProcessBackend {
    python_bin: String,
    #[cfg_attr(
        not(all(target_os = "linux", target_arch = "x86_64")),
        allow(dead_code)
    )]
    cgroup_parent: Option<PathBuf>,
}

impl ProcessBackend {
    pub fn new(python_bin: impl Into<String>) -> Self {
        Self {
            python_bin: python_bin.into(),
            cgroup_parent: None,
        }
    }

    /// Without a parent no pids limit is enforced: RLIMIT_NPROC would count
    /// every process of the gateway's UID, not just the unit's.
    pub fn with_cgroup_parent(mut self, parent: Option<PathBuf>) -> Self {
        self.cgroup_parent = parent;
        self
    }

    #[cfg_attr(
        not(all(target_os = "linux", target_arch = "x86_64")),
        allow(dead_code)
    )]
    fn command(&self, spec: &UnitSpec<'_>) -> Command {
        let mut command = match spec.entrypoint {
            Entrypoint::Python { script } => {
                let mut command = Command::new(&self.python_bin);
                command.arg(spec.script_dir.join(script));
                command
            }
            Entrypoint::Shell { command: line } => {
                let mut command = Command::new("/bin/sh");
                command.arg("-c").arg(line);
                command
            }
        };
        let mut env = base_environment(spec.environment);
        env.insert("HOME".to_string(), spec.work_dir.display().to_string());
        env.insert("TMPDIR".to_string(), spec.work_dir.display().to_string());
        command
            .env_clear()
            .envs(env)
            .current_dir(spec.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn launch(&self, spec: &UnitSpec<'_>) -> Result<LaunchedUnit, SandboxError> {
        use std::os::unix::io::AsRawFd;
        use std::os::unix::process::CommandExt;

        let network = super::seccomp::NetworkFilter::new();
        let ruleset = super::landlock::WriteRuleset::for_work_dir(spec.work_dir)?;
        let writes = ruleset.is_none().then(super::seccomp::WriteFilter::new);
        log::debug!(
            "process unit filesystem guard: {}",
            if ruleset.is_some() { "landlock" } else { "seccomp" }
        );
        let (cgroup, procs) = match self.unit_scope(&spec.limits)? {
            Some((path, procs)) => (Some(path), Some(procs)),
            None => (None, None),
        };
        // `procs` stays open until the child has exec'd.
        let procs_fd = procs.as_ref().map(|file| file.as_raw_fd());
        let limits = spec.limits;
        let mut command = self.command(spec);
        unsafe {
            command.pre_exec(move || {
                if let Some(fd) = procs_fd {
                    super::cgroup::join_scope(fd)?;
                }
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                set_rlimit(libc::RLIMIT_AS, limits.memory_bytes)?;
                set_rlimit(libc::RLIMIT_CPU, limits.cpu_seconds)?;
                set_rlimit(libc::RLIMIT_CORE, 0)?;
                network.install()?;
                if let Some(filter) = &writes {
                    filter.install()?;
                }
                if let Some(ruleset) = &ruleset {
                    ruleset.restrict_self()?;
                }
                Ok(())
            });
        }
        let spawned = command.spawn();
        drop(procs);
        match spawned {
            Ok(child) => {
                let handle = UnitHandle::ProcessGroup {
                    pgid: child.id(),
                    cgroup,
                };
                Ok(LaunchedUnit { child, handle })
            }
            Err(err) => {
                if let Some(path) = &cgroup {
                    super::cgroup::remove_scope(path);
                }
                Err(SandboxError::Spawn(format!("{}: {err}", self.describe(spec))))
            }
        }
    }

    fn terminate(&self, handle: &UnitHandle) {
        if let UnitHandle::ProcessGroup { pgid, cgroup } = handle {
            let rc = unsafe { libc::kill(-(*pgid as libc::pid_t), libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    log::warn!("failed to kill process group {pgid}: {err}");
                }
            }
            if let Some(path) = cgroup {
                super::cgroup::kill_scope(path);
            }
        }
    }

    fn destroy(&self, handle: &UnitHandle) {
        self.terminate(handle);
        if let UnitHandle::ProcessGroup {
            cgroup: Some(path), ..
        } = handle
        {
            super::cgroup::remove_scope(path);
        }
    }

    fn check(&self) -> Result<(), SandboxError> {
        Ok(())
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl ProcessBackend {
    /// Creates the unit's cgroup and opens its `cgroup.procs` for the child.
    fn unit_scope(
        &self,
        limits: &UnitLimits,
    ) -> Result<Option<(PathBuf, std::fs::File)>, SandboxError> {
        let Some(parent) = &self.cgroup_parent else {
            return Ok(None);
        };
        let name = format!("unit-{}", uuid::Uuid::new_v4().simple());
        let path = super::cgroup::create_unit_scope(parent, &name, limits)?;
        match super::cgroup::procs_file(&path) {
            Ok(procs) => Ok(Some((path, procs))),
            Err(err) => {
                super::cgroup::remove_scope(&path);
                Err(SandboxError::Backend(format!(
                    "failed to open {}/cgroup.procs: {err}",
                    path.display()
                )))
            }
        }
    }

    fn describe(&self, spec: &UnitSpec<'_>) -> String {
        match spec.entrypoint {
            Entrypoint::Python { .. } => format!("failed to start {}", self.python_bin),
            Entrypoint::Shell { .. } => "failed to start /bin/sh".to_string(),
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(target_os = "linux", target_arch = "x86_64", not(target_env = "gnu")))]
type RlimitResource = libc::c_int;

/// Soft limit `value`, hard limit one above so a CPU overrun gets SIGXCPU
/// before SIGKILL.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn set_rlimit(resource: RlimitResource, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value.saturating_add(u64::from(value > 0)) as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn launch(&self, _spec: &UnitSpec<'_>) -> Result<LaunchedUnit, SandboxError> {
        Err(SandboxError::Unsupported(
            "process isolation needs linux x86_64; use the container backend".to_string(),
        ))
    }

    fn terminate(&self, _handle: &UnitHandle) {}

    fn destroy(&self, _handle: &UnitHandle) {}

    fn check(&self) -> Result<(), SandboxError> {
        Err(SandboxError::Unsupported(
            "process isolation needs linux x86_64".to_string(),
        ))
    }
}

// -------------------- Container backend --------------------

/// Runs the unit in a throwaway container through the `docker` CLI.
#[derive(Clone, Debug)]
pub struct ContainerBackend {
    docker_bin: PathBuf,
    image: String,
}

impl ContainerBackend {
    pub fn new(docker_bin: impl Into<PathBuf>, image: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            image: image.into(),
        }
    }

    fn docker(&self) -> Command {
        let mut command = Command::new(&self.docker_bin);
        command.stdin(Stdio::null());
        command
    }

    /// Arguments for `docker create`. Environment values are passed by name
    /// only (`-e KEY`) and supplied through the CLI's own environment so they
    /// never appear on a command line.
    pub fn create_args(&self, spec: &UnitSpec<'_>) -> Vec<String> {
        let memory_mb = (spec.limits.memory_bytes / (1024 * 1024)).max(6);
        let mut args: Vec<String> = vec![
            "create".into(),
            "--memory".into(),
            format!("{memory_mb}m"),
            "--memory-swap".into(),
            format!("{memory_mb}m"),
            "--cpus".into(),
            format!("{}", spec.limits.cpus),
            "--pids-limit".into(),
            spec.limits.pids.to_string(),
            "--network".into(),
            "none".into(),
            "--read-only".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--tmpfs".into(),
            "/tmp:rw,noexec,nosuid,size=64m".into(),
            "-v".into(),
            format!("{}:{CONTAINER_SCRIPT_DIR}:ro", spec.script_dir.display()),
            "-v".into(),
            format!("{}:{CONTAINER_WORK_DIR}:rw", spec.work_dir.display()),
            "-w".into(),
            CONTAINER_WORK_DIR.into(),
        ];
        for key in base_environment(spec.environment).keys() {
            args.push("-e".into());
            args.push(key.clone());
        }
        args.push(self.image.clone());
        match spec.entrypoint {
            Entrypoint::Python { script } => {
                args.push("python3".into());
                args.push(format!("{CONTAINER_SCRIPT_DIR}/{script}"));
            }
            Entrypoint::Shell { command } => {
                args.push("/bin/sh".into());
                args.push("-c".into());
                args.push(command.clone());
            }
        }
        args
    }

    fn run_quiet(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        self.docker().args(args).output()
    }
}

impl IsolationBackend for ContainerBackend {
    fn name(&self) -> &'static str {
        "container"
    }

    fn launch(&self, spec: &UnitSpec<'_>) -> Result<LaunchedUnit, SandboxError> {
        let output = self
            .docker()
            .args(self.create_args(spec))
            .envs(base_environment(spec.environment))
            .output()
            .map_err(|err| SandboxError::Spawn(format!("failed to run docker: {err}")))?;
        if !output.status.success() {
            return Err(SandboxError::Backend(format!(
                "docker create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(SandboxError::Backend(
                "docker create returned no container id".to_string(),
            ));
        }
        let handle = UnitHandle::Container { id: id.clone() };
        let child = self
            .docker()
            .args(["start", "-a", &id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        match child {
            Ok(child) => Ok(LaunchedUnit { child, handle }),
            Err(err) => {
                self.destroy(&handle);
                Err(SandboxError::Spawn(format!("docker start failed: {err}")))
            }
        }
    }

    fn terminate(&self, handle: &UnitHandle) {
        if let UnitHandle::Container { id } = handle {
            if let Err(err) = self.run_quiet(&["kill", "--signal", "KILL", id]) {
                log::warn!("docker kill {id} failed: {err}");
            }
        }
    }

    fn destroy(&self, handle: &UnitHandle) {
        if let UnitHandle::Container { id } = handle {
            match self.run_quiet(&["rm", "-f", id]) {
                Ok(output) if output.status.success() => {}
                Ok(output) => log::warn!(
                    "docker rm {id} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(err) => log::warn!("docker rm {id} failed: {err}"),
            }
        }
    }

    fn check(&self) -> Result<(), SandboxError> {
        let output = self
            .run_quiet(&["version", "--format", "{{.Server.Version}}"])
            .map_err(|err| SandboxError::Backend(format!("docker unavailable: {err}")))?;
        if !output.status.success() {
            return Err(SandboxError::Backend(format!(
                "docker daemon unavailable: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
