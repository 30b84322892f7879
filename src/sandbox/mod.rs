//! Sandboxed execution of untrusted code and shell commands.
//!
//! Each run gets a fresh execution unit from an [`IsolationBackend`]: a
//! read-only script directory, a writable work directory, resource limits,
//! no network. A [`UnitGuard`] owns the unit and both directories, so the
//! unit is killed and removed on every exit path, including panics.
//!
//! Concurrency is bounded by a semaphore; [`SandboxExecutor::reserve`]
//! blocks until a slot frees.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;

use crate::now_ms;

pub mod backend;
#[cfg(target_os = "linux")]
pub mod cgroup;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod landlock;
pub mod limiter;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod seccomp;

pub use backend::{
    ContainerBackend, Entrypoint, IsolationBackend, LaunchedUnit, ProcessBackend, UnitHandle,
    UnitLimits, UnitSpec,
};
pub use limiter::{Permit, Semaphore};

pub const DEFAULT_IMAGE: &str = "python:3.11-slim";
pub const DEFAULT_PYTHON_BIN: &str = "python3";
pub const DEFAULT_CPU_LIMIT: f64 = 0.5;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 128;
pub const DEFAULT_PIDS_LIMIT: u64 = 64;
pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
const MAX_LINE_BYTES: u64 = 64 * 1024;
const SCRIPT_NAME: &str = "main.py";
const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to start execution unit: {0}")]
    Spawn(String),
    #[error("sandbox backend error: {0}")]
    Backend(String),
    #[error("sandbox io error: {0}")]
    Io(#[from] io::Error),
    #[error("sandbox unsupported: {0}")]
    Unsupported(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Process,
    Container,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(BackendKind::Process),
            "container" | "docker" => Ok(BackendKind::Container),
            other => Err(format!("unknown sandbox backend '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SandboxConfig {
    pub backend: BackendKind,
    pub docker_bin: String,
    pub image: String,
    pub python_bin: String,
    pub cpu_limit: f64,
    pub memory_limit_mb: u64,
    pub pids_limit: u64,
    /// Delegated cgroup v2 directory for per-unit scopes. The process backend
    /// enforces `pids_limit` only when this is set.
    pub cgroup_parent: Option<PathBuf>,
    pub max_concurrent: usize,
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Process,
            docker_bin: "docker".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            python_bin: DEFAULT_PYTHON_BIN.to_string(),
            cpu_limit: DEFAULT_CPU_LIMIT,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            pids_limit: DEFAULT_PIDS_LIMIT,
            cgroup_parent: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Program {
    Python { code: String },
    Shell { command: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecRequest {
    pub program: Program,
    pub timeout: Duration,
    pub environment: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(rename = "durationMs", serialize_with = "as_millis")]
    pub duration: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecOutcome {
    Completed(ExecResult),
    TimedOut {
        stdout: String,
        stderr: String,
        after: Duration,
    },
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub stream: StreamKind,
    pub line: String,
    pub at_ms: u64,
}

#[derive(Clone)]
pub struct SandboxExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    config: SandboxConfig,
    backend: Arc<dyn IsolationBackend>,
    permits: Arc<Semaphore>,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        let backend: Arc<dyn IsolationBackend> = match config.backend {
            BackendKind::Process => Arc::new(
                ProcessBackend::new(config.python_bin.clone())
                    .with_cgroup_parent(config.cgroup_parent.clone()),
            ),
            BackendKind::Container => Arc::new(ContainerBackend::new(
                config.docker_bin.clone(),
                config.image.clone(),
            )),
        };
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: SandboxConfig, backend: Arc<dyn IsolationBackend>) -> Self {
        let permits = Semaphore::new(config.max_concurrent.max(1));
        Self {
            inner: Arc::new(ExecutorInner {
                config,
                backend,
                permits,
            }),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn available_slots(&self) -> usize {
        self.inner.permits.available()
    }

    pub fn check(&self) -> Result<(), SandboxError> {
        self.inner.backend.check()
    }

    /// Waits for a free execution slot.
    pub fn reserve(&self) -> ExecutionSlot {
        ExecutionSlot {
            _permit: self.inner.permits.acquire(),
            executor: self.clone(),
        }
    }

    pub fn run(&self, request: &ExecRequest) -> Result<ExecOutcome, SandboxError> {
        self.reserve().run(request)
    }

    pub fn run_streaming(&self, request: ExecRequest) -> Result<LogStream, SandboxError> {
        self.reserve().run_streaming(request)
    }

    fn limits(&self, timeout: Duration) -> UnitLimits {
        let config = &self.inner.config;
        UnitLimits {
            memory_bytes: config.memory_limit_mb.saturating_mul(1024 * 1024),
            cpus: config.cpu_limit,
            cpu_seconds: UnitLimits::cpu_seconds_for(timeout, config.cpu_limit),
            pids: config.pids_limit,
        }
    }

    fn launch(&self, request: &ExecRequest) -> Result<(UnitGuard, Child), SandboxError> {
        let script_dir = tempfile::Builder::new().prefix("qgate-script-").tempdir()?;
        let work_dir = tempfile::Builder::new().prefix("qgate-work-").tempdir()?;
        let entrypoint = match &request.program {
            Program::Python { code } => {
                write_read_only(&script_dir.path().join(SCRIPT_NAME), code.as_bytes())?;
                Entrypoint::Python {
                    script: SCRIPT_NAME.to_string(),
                }
            }
            Program::Shell { command } => Entrypoint::Shell {
                command: command.clone(),
            },
        };
        let spec = UnitSpec {
            entrypoint: &entrypoint,
            script_dir: script_dir.path(),
            work_dir: work_dir.path(),
            environment: &request.environment,
            limits: self.limits(request.timeout),
        };
        let LaunchedUnit { child, handle } = self.inner.backend.launch(&spec)?;
        log::debug!(
            "launched {} unit {handle:?} (timeout {:?})",
            self.inner.backend.name(),
            request.timeout
        );
        Ok((
            UnitGuard {
                backend: self.inner.backend.clone(),
                handle,
                _script_dir: script_dir,
                _work_dir: work_dir,
            },
            child,
        ))
    }

    fn execute(
        &self,
        request: &ExecRequest,
        events: Option<Sender<LogEvent>>,
    ) -> Result<ExecOutcome, SandboxError> {
        let started = Instant::now();
        let (guard, mut child) = self.launch(request)?;
        let max_output = self.inner.config.max_output_bytes;
        let stdout =
            spawn_reader(child.stdout.take(), StreamKind::Stdout, max_output, events.clone());
        let stderr = spawn_reader(child.stderr.take(), StreamKind::Stderr, max_output, events);

        let status = match wait_deadline(&mut child, started + request.timeout) {
            Ok(status) => status,
            Err(err) => {
                guard.terminate();
                let _ = child.wait();
                return Err(err.into());
            }
        };
        let status = match status {
            Some(status) if cpu_exhausted(status) => {
                log::info!("execution hit its CPU time backstop");
                None
            }
            Some(status) => Some(status),
            None => {
                guard.terminate();
                child.wait()?;
                None
            }
        };
        // Background processes left by the unit would keep the pipes open.
        guard.terminate();
        let stdout = join_reader(stdout);
        let stderr = join_reader(stderr);
        let elapsed = started.elapsed();
        drop(guard);

        Ok(match status {
            Some(status) => ExecOutcome::Completed(ExecResult {
                stdout,
                stderr,
                exit_code: exit_code(status),
                duration: elapsed,
            }),
            None => {
                log::info!("execution timed out after {:?}", request.timeout);
                ExecOutcome::TimedOut {
                    stdout,
                    stderr,
                    after: elapsed,
                }
            }
        })
    }
}

/// A held concurrency slot. Running consumes it and the slot frees when the
/// run ends.
pub struct ExecutionSlot {
    _permit: Permit,
    executor: SandboxExecutor,
}

impl ExecutionSlot {
    pub fn run(self, request: &ExecRequest) -> Result<ExecOutcome, SandboxError> {
        self.executor.execute(request, None)
    }

    /// Starts the run on a supervisor thread and returns its log lines as
    /// they arrive.
    pub fn run_streaming(self, request: ExecRequest) -> Result<LogStream, SandboxError> {
        let (tx, rx) = mpsc::channel();
        let supervisor = std::thread::Builder::new()
            .name("sandbox-stream".to_string())
            .spawn(move || {
                let slot = self;
                slot.executor.execute(&request, Some(tx))
            })?;
        Ok(LogStream {
            events: rx,
            supervisor: Some(supervisor),
        })
    }
}

/// Live log lines of a streaming run. Iteration ends when the unit's output
/// closes; [`LogStream::finish`] then yields the outcome.
pub struct LogStream {
    events: Receiver<LogEvent>,
    supervisor: Option<JoinHandle<Result<ExecOutcome, SandboxError>>>,
}

impl Iterator for LogStream {
    type Item = LogEvent;

    fn next(&mut self) -> Option<LogEvent> {
        self.events.recv().ok()
    }
}

impl LogStream {
    pub fn finish(mut self) -> Result<ExecOutcome, SandboxError> {
        for _ in self.events.iter() {}
        match self.supervisor.take() {
            Some(supervisor) => supervisor.join().unwrap_or_else(|_| {
                Err(SandboxError::Backend(
                    "sandbox supervisor panicked".to_string(),
                ))
            }),
            None => Err(SandboxError::Backend("stream already finished".to_string())),
        }
    }
}

/// Owns an execution unit and its directories. Drop kills and removes the
/// unit before the directories are deleted.
pub struct UnitGuard {
    backend: Arc<dyn IsolationBackend>,
    handle: UnitHandle,
    _script_dir: TempDir,
    _work_dir: TempDir,
}

impl UnitGuard {
    pub fn handle(&self) -> &UnitHandle {
        &self.handle
    }

    pub fn terminate(&self) {
        self.backend.terminate(&self.handle);
    }
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        self.backend.terminate(&self.handle);
        self.backend.destroy(&self.handle);
    }
}

fn write_read_only(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o400))?;
    }
    #[cfg(not(unix))]
    {
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

/// Reads one stream line by line, keeping at most `max_bytes` and forwarding
/// every line to `events`. Keeps draining after the cap so the unit never
/// blocks on a full pipe.
fn spawn_reader<R: Read + Send + 'static>(
    source: Option<R>,
    stream: StreamKind,
    max_bytes: usize,
    events: Option<Sender<LogEvent>>,
) -> Option<JoinHandle<String>> {
    let source = source?;
    let spawned = std::thread::Builder::new()
        .name(format!("sandbox-{stream:?}").to_lowercase())
        .spawn(move || {
            let mut reader = BufReader::new(source);
            let mut collected: Vec<u8> = Vec::new();
            let mut truncated = false;
            let mut events = events;
            let mut line = Vec::new();
            loop {
                line.clear();
                match (&mut reader).take(MAX_LINE_BYTES).read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        log::debug!("sandbox {stream:?} reader stopped: {err}");
                        break;
                    }
                }
                let room = max_bytes.saturating_sub(collected.len());
                if line.len() > room {
                    truncated = true;
                }
                collected.extend_from_slice(&line[..line.len().min(room)]);
                if let Some(tx) = &events {
                    let text = String::from_utf8_lossy(&line);
                    let event = LogEvent {
                        stream,
                        line: text.strip_suffix('\n').unwrap_or(&text).to_string(),
                        at_ms: now_ms(),
                    };
                    if tx.send(event).is_err() {
                        // Consumer went away; keep collecting only.
                        events = None;
                    }
                }
            }
            if truncated {
                log::debug!("sandbox {stream:?} output truncated at {max_bytes} bytes");
            }
            String::from_utf8_lossy(&collected).into_owned()
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            log::error!("failed to spawn sandbox output reader: {err}");
            None
        }
    }
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Polls the child until it exits or `deadline` passes. `Ok(None)` means
/// the child is still running.
fn wait_deadline(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(WAIT_POLL.min(deadline - now));
    }
}

/// A unit killed by SIGXCPU ran past its deadline in CPU time before the
/// wall clock caught it; that is a timeout, not a failure.
fn cpu_exhausted(status: ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal() == Some(libc::SIGXCPU)
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        false
    }
}

/// Signal deaths map to `128 + signal` like a shell reports them.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
