//! Gateway configuration: optional file named by `QGATE_CONFIG` (TOML, or
//! JSON when the name ends in `.json`), built-in defaults, then `QGATE_*`
//! environment overrides.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::artifact::{
    ArtifactLimits, DEFAULT_MAX_ARTIFACT_BYTES, DEFAULT_MAX_ARTIFACT_COUNT,
    DEFAULT_ORIGINATOR_QUOTA_BYTES,
};
use crate::auth::{AuthSettings, RateLimitConfig, SecretEntry};
use crate::jobs::{DEFAULT_MAX_JOBS, DEFAULT_RETENTION_SECONDS};
use crate::sandbox::{BackendKind, SandboxConfig};

const DEFAULT_DB_PATH: &str = "gateway.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_SCHEMA_DIR: &str = "schemas";
const DEFAULT_STORAGE_DIR: &str = "artifacts";
const DEFAULT_CLOCK_SKEW_SECONDS: u64 = 300;
const DEFAULT_NONCE_TTL_SECONDS: u64 = 600;
const DEFAULT_RATE_LIMIT_PER_ORIGINATOR: u64 = 60;
const DEFAULT_RATE_LIMIT_PER_IP: u64 = 100;
const DEFAULT_KEY_VERSION: &str = "v1";
const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 300;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct GatewayConfigFile {
    db_path: Option<String>,
    #[serde(alias = "cleanupIntervalSeconds")]
    cleanup_interval_seconds: Option<u64>,
    api: Option<ApiConfigFile>,
    auth: Option<AuthConfigFile>,
    cache: Option<CacheConfigFile>,
    schema: Option<SchemaConfigFile>,
    sandbox: Option<SandboxConfigFile>,
    storage: Option<StorageConfigFile>,
    jobs: Option<JobsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AuthConfigFile {
    #[serde(alias = "clockSkewSeconds")]
    clock_skew_seconds: Option<u64>,
    #[serde(alias = "nonceTtlSeconds")]
    nonce_ttl_seconds: Option<u64>,
    #[serde(alias = "rateLimitsPerOriginator")]
    rate_limit_per_originator: Option<u64>,
    #[serde(alias = "rateLimitsPerIp")]
    rate_limit_per_ip: Option<u64>,
    default_key_version: Option<String>,
    secrets: Option<Vec<SecretConfigFile>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SecretConfigFile {
    originator: String,
    key_version: String,
    secret_hex: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CacheConfigFile {
    redis_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SchemaConfigFile {
    dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SandboxConfigFile {
    backend: Option<String>,
    docker_bin: Option<String>,
    image: Option<String>,
    python_bin: Option<String>,
    #[serde(alias = "sandboxCpuLimit")]
    cpu_limit: Option<f64>,
    #[serde(alias = "sandboxMemoryLimitMb")]
    memory_limit_mb: Option<u64>,
    pids_limit: Option<u64>,
    cgroup_parent: Option<PathBuf>,
    max_concurrent: Option<usize>,
    max_output_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StorageConfigFile {
    dir: Option<PathBuf>,
    #[serde(alias = "maxArtifactBytes")]
    max_artifact_bytes: Option<u64>,
    #[serde(alias = "maxArtifactCount")]
    max_artifact_count: Option<u64>,
    originator_quota_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct JobsConfigFile {
    max_jobs: Option<usize>,
    retention_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub db_path: String,
    pub api_addr: String,
    pub auth: AuthSettings,
    pub secrets: Vec<SecretEntry>,
    pub redis_url: Option<String>,
    pub schema_dir: PathBuf,
    pub sandbox: SandboxConfig,
    pub storage_dir: PathBuf,
    pub artifact_limits: ArtifactLimits,
    pub jobs: JobSettings,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSettings {
    pub max_jobs: usize,
    pub retention: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            api_addr: DEFAULT_API_ADDR.to_string(),
            auth: AuthSettings {
                clock_skew: Duration::from_secs(DEFAULT_CLOCK_SKEW_SECONDS),
                nonce_ttl: Duration::from_secs(DEFAULT_NONCE_TTL_SECONDS),
                rate_limits: RateLimitConfig {
                    per_originator: DEFAULT_RATE_LIMIT_PER_ORIGINATOR,
                    per_ip: DEFAULT_RATE_LIMIT_PER_IP,
                    ..RateLimitConfig::default()
                },
                default_key_version: DEFAULT_KEY_VERSION.to_string(),
            },
            secrets: Vec::new(),
            redis_url: None,
            schema_dir: PathBuf::from(DEFAULT_SCHEMA_DIR),
            sandbox: SandboxConfig::default(),
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            artifact_limits: ArtifactLimits {
                max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
                max_artifact_count: DEFAULT_MAX_ARTIFACT_COUNT,
                originator_quota_bytes: DEFAULT_ORIGINATOR_QUOTA_BYTES,
            },
            jobs: JobSettings {
                max_jobs: DEFAULT_MAX_JOBS,
                retention: Duration::from_secs(DEFAULT_RETENTION_SECONDS),
            },
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECONDS),
        }
    }
}

impl GatewayConfig {
    pub fn load() -> Result<Self> {
        let file_cfg = match env_value("QGATE_CONFIG") {
            Some(path) => read_config_file(Path::new(&path))?,
            None => GatewayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads one config file with defaults filled in, ignoring the
    /// environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let cfg = Self::from_file(read_config_file(path)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GatewayConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let api = file.api.unwrap_or_default();
        let auth = file.auth.unwrap_or_default();
        let cache = file.cache.unwrap_or_default();
        let schema = file.schema.unwrap_or_default();
        let sandbox = file.sandbox.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let jobs = file.jobs.unwrap_or_default();

        let secrets = auth
            .secrets
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                SecretEntry::from_hex(&entry.originator, &entry.key_version, &entry.secret_hex)
            })
            .collect::<Result<Vec<_>>>()?;
        let backend = match sandbox.backend {
            Some(name) => name.parse::<BackendKind>().map_err(|e| anyhow!(e))?,
            None => defaults.sandbox.backend,
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or(defaults.db_path),
            api_addr: api.addr.unwrap_or(defaults.api_addr),
            auth: AuthSettings {
                clock_skew: auth
                    .clock_skew_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.auth.clock_skew),
                nonce_ttl: auth
                    .nonce_ttl_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.auth.nonce_ttl),
                rate_limits: RateLimitConfig {
                    per_originator: auth
                        .rate_limit_per_originator
                        .unwrap_or(defaults.auth.rate_limits.per_originator),
                    per_ip: auth
                        .rate_limit_per_ip
                        .unwrap_or(defaults.auth.rate_limits.per_ip),
                    window: defaults.auth.rate_limits.window,
                },
                default_key_version: auth
                    .default_key_version
                    .unwrap_or(defaults.auth.default_key_version),
            },
            secrets,
            redis_url: cache.redis_url,
            schema_dir: schema.dir.unwrap_or(defaults.schema_dir),
            sandbox: SandboxConfig {
                backend,
                docker_bin: sandbox.docker_bin.unwrap_or(defaults.sandbox.docker_bin),
                image: sandbox.image.unwrap_or(defaults.sandbox.image),
                python_bin: sandbox.python_bin.unwrap_or(defaults.sandbox.python_bin),
                cpu_limit: sandbox.cpu_limit.unwrap_or(defaults.sandbox.cpu_limit),
                memory_limit_mb: sandbox
                    .memory_limit_mb
                    .unwrap_or(defaults.sandbox.memory_limit_mb),
                pids_limit: sandbox.pids_limit.unwrap_or(defaults.sandbox.pids_limit),
                cgroup_parent: sandbox.cgroup_parent.or(defaults.sandbox.cgroup_parent),
                max_concurrent: sandbox
                    .max_concurrent
                    .unwrap_or(defaults.sandbox.max_concurrent),
                max_output_bytes: sandbox
                    .max_output_bytes
                    .unwrap_or(defaults.sandbox.max_output_bytes),
            },
            storage_dir: storage.dir.unwrap_or(defaults.storage_dir),
            artifact_limits: ArtifactLimits {
                max_artifact_bytes: storage
                    .max_artifact_bytes
                    .unwrap_or(defaults.artifact_limits.max_artifact_bytes),
                max_artifact_count: storage
                    .max_artifact_count
                    .unwrap_or(defaults.artifact_limits.max_artifact_count),
                originator_quota_bytes: storage
                    .originator_quota_bytes
                    .unwrap_or(defaults.artifact_limits.originator_quota_bytes),
            },
            jobs: JobSettings {
                max_jobs: jobs.max_jobs.unwrap_or(defaults.jobs.max_jobs),
                retention: jobs
                    .retention_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.jobs.retention),
            },
            cleanup_interval: file
                .cleanup_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("QGATE_DB_PATH") {
            self.db_path = path;
        }
        if let Some(addr) = env_value("QGATE_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(seconds) = env_parse::<u64>("QGATE_CLOCK_SKEW_SECONDS")? {
            self.auth.clock_skew = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("QGATE_NONCE_TTL_SECONDS")? {
            self.auth.nonce_ttl = Duration::from_secs(seconds);
        }
        if let Some(limit) = env_parse("QGATE_RATE_LIMIT_PER_ORIGINATOR")? {
            self.auth.rate_limits.per_originator = limit;
        }
        if let Some(limit) = env_parse("QGATE_RATE_LIMIT_PER_IP")? {
            self.auth.rate_limits.per_ip = limit;
        }
        if let Some(version) = env_value("QGATE_DEFAULT_KEY_VERSION") {
            self.auth.default_key_version = version;
        }
        if let Some(secrets) = env_value("QGATE_SECRETS") {
            self.secrets.extend(parse_secret_list(&secrets)?);
        }
        if let Some(url) = env_value("QGATE_REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(dir) = env_value("QGATE_SCHEMA_DIR") {
            self.schema_dir = PathBuf::from(dir);
        }
        if let Some(backend) = env_value("QGATE_SANDBOX_BACKEND") {
            self.sandbox.backend = backend
                .parse()
                .map_err(|e: String| anyhow!("QGATE_SANDBOX_BACKEND: {e}"))?;
        }
        if let Some(image) = env_value("QGATE_SANDBOX_IMAGE") {
            self.sandbox.image = image;
        }
        if let Some(bin) = env_value("QGATE_PYTHON_BIN") {
            self.sandbox.python_bin = bin;
        }
        if let Some(cpus) = env_parse("QGATE_SANDBOX_CPU_LIMIT")? {
            self.sandbox.cpu_limit = cpus;
        }
        if let Some(mb) = env_parse("QGATE_SANDBOX_MEMORY_LIMIT_MB")? {
            self.sandbox.memory_limit_mb = mb;
        }
        if let Some(pids) = env_parse("QGATE_SANDBOX_PIDS_LIMIT")? {
            self.sandbox.pids_limit = pids;
        }
        if let Some(dir) = env_value("QGATE_SANDBOX_CGROUP_PARENT") {
            self.sandbox.cgroup_parent = Some(PathBuf::from(dir));
        }
        if let Some(slots) = env_parse("QGATE_SANDBOX_MAX_CONCURRENT")? {
            self.sandbox.max_concurrent = slots;
        }
        if let Some(bytes) = env_parse("QGATE_SANDBOX_MAX_OUTPUT_BYTES")? {
            self.sandbox.max_output_bytes = bytes;
        }
        if let Some(dir) = env_value("QGATE_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(bytes) = env_parse("QGATE_MAX_ARTIFACT_BYTES")? {
            self.artifact_limits.max_artifact_bytes = bytes;
        }
        if let Some(count) = env_parse("QGATE_MAX_ARTIFACT_COUNT")? {
            self.artifact_limits.max_artifact_count = count;
        }
        if let Some(bytes) = env_parse("QGATE_ORIGINATOR_QUOTA_BYTES")? {
            self.artifact_limits.originator_quota_bytes = bytes;
        }
        if let Some(max) = env_parse("QGATE_MAX_JOBS")? {
            self.jobs.max_jobs = max;
        }
        if let Some(seconds) = env_parse::<u64>("QGATE_JOB_RETENTION_SECONDS")? {
            self.jobs.retention = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("QGATE_CLEANUP_INTERVAL_SECONDS")? {
            self.cleanup_interval = Duration::from_secs(seconds);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("api addr {:?} is not a socket address", self.api_addr))?;
        if self.auth.clock_skew.is_zero() {
            return Err(anyhow!("clock skew must be greater than zero"));
        }
        // A nonce must outlive both sides of the skew window.
        if self.auth.nonce_ttl < self.auth.clock_skew * 2 {
            return Err(anyhow!(
                "nonce ttl ({}s) must be at least twice the clock skew ({}s)",
                self.auth.nonce_ttl.as_secs(),
                self.auth.clock_skew.as_secs()
            ));
        }
        if self.auth.default_key_version.trim().is_empty() {
            return Err(anyhow!("default key version must not be empty"));
        }
        if !(self.sandbox.cpu_limit > 0.0 && self.sandbox.cpu_limit.is_finite()) {
            return Err(anyhow!("sandbox cpu limit must be a positive number"));
        }
        if self.sandbox.memory_limit_mb == 0 || self.sandbox.pids_limit == 0 {
            return Err(anyhow!("sandbox memory and pids limits must be greater than zero"));
        }
        if self.sandbox.max_concurrent == 0 {
            return Err(anyhow!("sandbox max_concurrent must be greater than zero"));
        }
        let limits = &self.artifact_limits;
        if limits.max_artifact_bytes == 0 || limits.max_artifact_count == 0 {
            return Err(anyhow!("artifact limits must be greater than zero"));
        }
        if self.jobs.max_jobs == 0 {
            return Err(anyhow!("jobs max_jobs must be greater than zero"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(anyhow!("cleanup interval must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<GatewayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// `originator:key_version:hex` entries separated by commas.
fn parse_secret_list(value: &str) -> Result<Vec<SecretEntry>> {
    split_csv(value)
        .iter()
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(originator), Some(version), Some(hex))
                    if !originator.is_empty() && !version.is_empty() =>
                {
                    SecretEntry::from_hex(originator, version, hex)
                }
                _ => Err(anyhow!(
                    "QGATE_SECRETS entries must look like originator:key_version:hex"
                )),
            }
        })
        .collect()
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_value(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{name} has an invalid value {raw:?}")),
        None => Ok(None),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
