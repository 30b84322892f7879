//! The gateway context: authenticate, validate, then route a typed intent
//! to the sandbox or the artifact service.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::artifact::{
    ArtifactMetadata, ArtifactReceipt, ArtifactService, ArtifactStore, Ledger, QueryPage,
    StorageError, VerifiedReader,
};
use crate::auth::{CachedSecrets, SignatureVerifier, SignedRequest, StaticSecrets, VerifiedCaller};
use crate::cache::{MemoryCache, SharedCache};
use crate::config::GatewayConfig;
use crate::db::Database;
use crate::error::GatewayError;
use crate::intent::{Intent, IntentParams};
use crate::jobs::{Job, JobTable};
use crate::sandbox::{ExecRequest, LogEvent, LogStream, Program, SandboxError, SandboxExecutor};
use crate::schema::{SchemaCache, ValidationError};
use crate::{now_ms, now_s};

/// What a dispatched intent produced.
pub enum Dispatched {
    /// Execution accepted; the job runs in the background.
    Accepted(Job),
    /// Execution running with live logs.
    Stream(JobStream),
    Stored(ArtifactReceipt),
    Artifact {
        meta: ArtifactMetadata,
        reader: VerifiedReader,
    },
    Deleted(Uuid),
    Updated(ArtifactMetadata),
    Page(QueryPage),
    Job(Job),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub checks: BTreeMap<&'static str, String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub expired_artifacts: usize,
    pub expired_nonces: usize,
    pub stale_uploads: usize,
    pub evicted_jobs: usize,
    pub expired_cache_entries: usize,
}

pub struct Gateway {
    config: GatewayConfig,
    db: Arc<Database>,
    cache: Arc<dyn SharedCache>,
    verifier: SignatureVerifier,
    schemas: SchemaCache,
    sandbox: SandboxExecutor,
    artifacts: ArtifactService,
    jobs: Arc<JobTable>,
}

impl Gateway {
    pub fn open(config: GatewayConfig) -> Result<Arc<Self>> {
        let sandbox = SandboxExecutor::new(config.sandbox.clone());
        Self::open_with_sandbox(config, sandbox)
    }

    /// Opens the gateway with a caller-provided executor.
    pub fn open_with_sandbox(config: GatewayConfig, sandbox: SandboxExecutor) -> Result<Arc<Self>> {
        config.validate()?;
        let db = Arc::new(Database::open(&config.db_path)?);
        let cache = open_cache(config.redis_url.as_deref())?;

        if config.secrets.is_empty() {
            log::warn!("no signing secrets configured; every request will be rejected");
        }
        let secrets = CachedSecrets::new(StaticSecrets::new(config.secrets.clone()), cache.clone());
        let verifier = SignatureVerifier::new(
            config.auth.clone(),
            cache.clone(),
            db.clone(),
            Arc::new(secrets),
        );

        let schemas = SchemaCache::new(&config.schema_dir, cache.clone())?;
        match schemas.preload() {
            Ok(count) => {
                log::info!("preloaded {count} schemas from {}", config.schema_dir.display())
            }
            Err(err) => log::warn!("schema preload failed: {err:#}"),
        }

        std::fs::create_dir_all(&config.storage_dir).with_context(|| {
            format!("failed to create storage dir {}", config.storage_dir.display())
        })?;
        let store = ArtifactStore::open(&config.storage_dir).with_context(|| {
            format!("failed to open artifact store {}", config.storage_dir.display())
        })?;
        let artifacts = ArtifactService::new(
            store,
            Ledger::new(db.clone(), cache.clone()),
            cache.clone(),
            config.artifact_limits,
        );
        let jobs = Arc::new(JobTable::new(config.jobs.max_jobs, config.jobs.retention));

        log::info!(
            "gateway ready: db={} storage={} sandbox={} (max {} concurrent)",
            config.db_path,
            config.storage_dir.display(),
            sandbox.backend_name(),
            sandbox.config().max_concurrent
        );
        Ok(Arc::new(Self {
            config,
            db,
            cache,
            verifier,
            schemas,
            sandbox,
            artifacts,
            jobs,
        }))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn cache(&self) -> &Arc<dyn SharedCache> {
        &self.cache
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    pub fn schemas(&self) -> &SchemaCache {
        &self.schemas
    }

    pub fn sandbox(&self) -> &SandboxExecutor {
        &self.sandbox
    }

    pub fn artifacts(&self) -> &ArtifactService {
        &self.artifacts
    }

    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    pub fn authenticate(
        &self,
        request: &SignedRequest<'_>,
    ) -> Result<VerifiedCaller, GatewayError> {
        Ok(self.verifier.verify(request)?)
    }

    /// Validates the signed document into a typed intent. The originator is
    /// the one the signature was checked against.
    pub fn admit(&self, caller: &VerifiedCaller, document: &[u8]) -> Result<Intent, GatewayError> {
        let intent = Intent::parse(document, &self.schemas)?;
        if intent.originator != caller.originator {
            return Err(ValidationError::Invalid {
                path: "/originator".to_string(),
                message: "originator does not match the signed caller".to_string(),
            }
            .into());
        }
        Ok(intent)
    }

    /// Authenticates, validates and dispatches in one step.
    pub fn submit(
        &self,
        request: &SignedRequest<'_>,
        body: Option<&mut dyn Read>,
    ) -> Result<Dispatched, GatewayError> {
        let caller = self.authenticate(request)?;
        let intent = self.admit(&caller, request.document)?;
        self.dispatch(intent, body)
    }

    /// Routes a validated intent. `body` carries the bytes of a
    /// `storeArtifact` upload.
    pub fn dispatch(
        &self,
        intent: Intent,
        body: Option<&mut dyn Read>,
    ) -> Result<Dispatched, GatewayError> {
        log::info!(
            "dispatching {} {} for {}",
            intent.kind(),
            intent.intent_id,
            intent.originator
        );
        let requester = intent.originator.clone();
        match &intent.params {
            IntentParams::RunCode(_) | IntentParams::RunCommand(_) => self.execute(intent),
            IntentParams::StoreArtifact(options) => {
                let body = body.ok_or_else(|| {
                    ValidationError::Malformed(
                        "storeArtifact needs a binary request body".to_string(),
                    )
                })?;
                Ok(Dispatched::Stored(self.artifacts.upload(&requester, options, body)?))
            }
            IntentParams::RetrieveArtifact { artifact_id } => {
                let (meta, reader) = self.artifacts.download(&requester, artifact_id)?;
                Ok(Dispatched::Artifact { meta, reader })
            }
            IntentParams::DeleteArtifact { artifact_id } => {
                if !self.artifacts.delete(&requester, artifact_id)? {
                    return Err(StorageError::NotFound(*artifact_id).into());
                }
                Ok(Dispatched::Deleted(*artifact_id))
            }
            IntentParams::UpdateArtifact {
                artifact_id,
                changes,
            } => Ok(Dispatched::Updated(
                self.artifacts.update(&requester, artifact_id, changes)?,
            )),
            IntentParams::QueryArtifacts(query) => {
                Ok(Dispatched::Page(self.artifacts.query(&requester, query)?))
            }
            IntentParams::JobStatus { job_id } => {
                Ok(Dispatched::Job(self.job_status(&requester, job_id)?))
            }
        }
    }

    /// A job is visible to its originator only.
    pub fn job_status(&self, requester: &str, job_id: &Uuid) -> Result<Job, GatewayError> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| GatewayError::NotFound(format!("job {job_id}")))?;
        if job.originator != requester {
            log::warn!("{requester} denied status of job {job_id}");
            return Err(GatewayError::AccessDenied(format!("job {job_id}")));
        }
        Ok(job)
    }

    fn execute(&self, intent: Intent) -> Result<Dispatched, GatewayError> {
        let request = exec_request(&intent)?;
        let job = self.jobs.submit(&intent)?;
        let job_id = job.job_id;

        if intent.streams_logs() {
            // Queued until a slot frees, then running with live output.
            let slot = self.sandbox.reserve();
            self.jobs.mark_running(&job_id)?;
            return match slot.run_streaming(request) {
                Ok(logs) => Ok(Dispatched::Stream(JobStream {
                    job_id,
                    jobs: self.jobs.clone(),
                    logs: Some(logs),
                })),
                Err(err) => {
                    self.jobs
                        .complete(&job_id, &Err(SandboxError::Backend(err.to_string())))?;
                    Err(err.into())
                }
            };
        }

        let sandbox = self.sandbox.clone();
        let jobs = self.jobs.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("job-{job_id}"))
            .spawn(move || {
                let slot = sandbox.reserve();
                if let Err(err) = jobs.mark_running(&job_id) {
                    log::error!("job {job_id} could not start: {err}");
                    return;
                }
                let outcome = slot.run(&request);
                if let Err(err) = &outcome {
                    log::error!("job {job_id} sandbox failure: {err}");
                }
                if let Err(err) = jobs.complete(&job_id, &outcome) {
                    log::error!("job {job_id} completion not recorded: {err}");
                }
            });
        if let Err(err) = spawned {
            self.jobs.discard(&job_id);
            return Err(GatewayError::Internal(format!("failed to spawn job worker: {err}")));
        }
        Ok(Dispatched::Accepted(job))
    }

    /// Durable store, shared cache, storage dir and sandbox backend.
    pub fn readiness(&self) -> Readiness {
        let mut checks = BTreeMap::new();
        checks.insert("database", describe(self.db.ping()));
        checks.insert("cache", describe(self.cache.ping()));
        checks.insert(
            "storage",
            describe(self.artifacts.store().check_writable().map_err(anyhow::Error::from)),
        );
        checks.insert(
            "sandbox",
            describe(self.sandbox.check().map_err(anyhow::Error::from)),
        );
        let ready = checks.values().all(|status| status == "ok");
        Readiness { ready, checks }
    }

    /// One pass of every periodic sweep.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        match self.artifacts.sweep_expired(now_s()) {
            Ok(count) => report.expired_artifacts = count,
            Err(err) => log::error!("artifact expiry sweep failed: {err}"),
        }
        match self.verifier.nonces().sweep(now_ms()) {
            Ok(count) => report.expired_nonces = count,
            Err(err) => log::error!("nonce sweep failed: {err:#}"),
        }
        match self.artifacts.cleanup_stale_uploads() {
            Ok(count) => report.stale_uploads = count,
            Err(err) => log::error!("stale upload cleanup failed: {err}"),
        }
        report.evicted_jobs = self.jobs.evict_expired(now_ms());
        match self.cache.purge_expired() {
            Ok(count) => report.expired_cache_entries = count,
            Err(err) => log::warn!("cache purge failed: {err:#}"),
        }
        for (key, stats) in self.schemas.stats() {
            log::debug!(
                "schema {key}: {} validations, {} errors",
                stats.validations,
                stats.errors
            );
        }
        report
    }
}

fn describe(result: Result<()>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(err) => format!("error: {err:#}"),
    }
}

fn exec_request(intent: &Intent) -> Result<ExecRequest, GatewayError> {
    let (program, timeout_seconds, environment) = match &intent.params {
        IntentParams::RunCode(manifest) => (
            Program::Python {
                code: manifest.code.clone(),
            },
            manifest.timeout_seconds,
            manifest.environment.clone(),
        ),
        IntentParams::RunCommand(manifest) => (
            Program::Shell {
                command: manifest.command.clone(),
            },
            manifest.timeout_seconds,
            manifest.environment.clone(),
        ),
        _ => {
            return Err(GatewayError::Internal(format!(
                "{} is not an execution intent",
                intent.kind()
            )))
        }
    };
    Ok(ExecRequest {
        program,
        timeout: Duration::from_secs(timeout_seconds),
        environment,
    })
}

#[cfg(feature = "redis-cache")]
fn open_cache(redis_url: Option<&str>) -> Result<Arc<dyn SharedCache>> {
    match redis_url {
        Some(url) => {
            let cache = crate::cache::RedisCache::open(url)?;
            log::info!("using redis shared cache");
            Ok(Arc::new(cache))
        }
        None => Ok(Arc::new(MemoryCache::new())),
    }
}

#[cfg(not(feature = "redis-cache"))]
fn open_cache(redis_url: Option<&str>) -> Result<Arc<dyn SharedCache>> {
    match redis_url {
        Some(_) => Err(anyhow!(
            "cache.redis_url is set but this build lacks the redis-cache feature"
        )),
        None => Ok(Arc::new(MemoryCache::new())),
    }
}

/// Live logs of a streaming job. When iteration ends, [`JobStream::finish`]
/// records the outcome; dropping the stream early does the same after the
/// run ends.
pub struct JobStream {
    job_id: Uuid,
    jobs: Arc<JobTable>,
    logs: Option<LogStream>,
}

impl JobStream {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn finish(mut self) -> Result<Job, GatewayError> {
        self.complete()
    }

    fn complete(&mut self) -> Result<Job, GatewayError> {
        let logs = self
            .logs
            .take()
            .ok_or_else(|| GatewayError::Internal("job stream already finished".to_string()))?;
        let outcome = logs.finish();
        Ok(self.jobs.complete(&self.job_id, &outcome)?)
    }
}

impl Iterator for JobStream {
    type Item = LogEvent;

    fn next(&mut self) -> Option<LogEvent> {
        self.logs.as_mut()?.next()
    }
}

impl Drop for JobStream {
    fn drop(&mut self) {
        if self.logs.is_some() {
            if let Err(err) = self.complete() {
                log::error!("job {} completion not recorded: {err}", self.job_id);
            }
        }
    }
}
