//! Bounded in-memory job table for execution intents.
//!
//! Status moves `queued -> running -> {completed | failed | timedOut}` and
//! never backwards. Finished jobs stay readable for the retention period,
//! then the maintenance sweep evicts them.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::intent::{Intent, IntentKind};
use crate::now_ms;
use crate::sandbox::{ExecOutcome, SandboxError};

pub const DEFAULT_MAX_JOBS: usize = 10_000;
pub const DEFAULT_RETENTION_SECONDS: u64 = 3600;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    pub fn can_become(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => next == JobStatus::Running,
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// `intent_id` and `kind` are what callers see of the intent. The intent
/// itself stays server-side: manifests carry code and environment values
/// that a status response must not echo back.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: Uuid,
    pub intent_id: Uuid,
    pub kind: IntentKind,
    #[serde(skip)]
    pub intent: Arc<Intent>,
    pub originator: String,
    pub status: JobStatus,
    pub submitted_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobsError {
    #[error("job table full ({max} jobs)")]
    OverCapacity { max: usize },
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {job_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}

pub struct JobTable {
    jobs: Mutex<HashMap<Uuid, Job>>,
    max_jobs: usize,
    retention: Duration,
}

impl JobTable {
    pub fn new(max_jobs: usize, retention: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            max_jobs: max_jobs.max(1),
            retention,
        }
    }

    /// Registers a queued job for `intent`. When the table is full the
    /// oldest finished job makes room; with none finished the submission is
    /// refused.
    pub fn submit(&self, intent: &Intent) -> Result<Job, JobsError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.len() >= self.max_jobs {
            let oldest = jobs
                .values()
                .filter(|job| job.status.is_terminal())
                .min_by_key(|job| job.completed_at.unwrap_or(0))
                .map(|job| job.job_id);
            match oldest {
                Some(id) => {
                    jobs.remove(&id);
                    log::debug!("evicted finished job {id} to make room");
                }
                None => {
                    log::warn!("job table full; rejecting {}", intent.intent_id);
                    return Err(JobsError::OverCapacity { max: self.max_jobs });
                }
            }
        }
        let job = Job {
            job_id: Uuid::new_v4(),
            intent_id: intent.intent_id,
            kind: intent.kind(),
            intent: Arc::new(intent.clone()),
            originator: intent.originator.clone(),
            status: JobStatus::Queued,
            submitted_at: now_ms(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        };
        jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    pub fn mark_running(&self, job_id: &Uuid) -> Result<Job, JobsError> {
        self.transition(job_id, JobStatus::Running, |job| {
            job.started_at = Some(now_ms());
        })
    }

    /// Records the sandbox outcome. A non-zero exit is `failed`, a deadline
    /// `timedOut`, a sandbox fault `failed` with the error text.
    pub fn complete(
        &self,
        job_id: &Uuid,
        outcome: &Result<ExecOutcome, SandboxError>,
    ) -> Result<Job, JobsError> {
        let (status, result, error) = match outcome {
            Ok(ExecOutcome::Completed(exec)) => {
                let status = if exec.exit_code == 0 {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                let result = JobResult {
                    stdout: exec.stdout.clone(),
                    stderr: exec.stderr.clone(),
                    exit_code: Some(exec.exit_code),
                    duration_ms: exec.duration.as_millis() as u64,
                };
                (status, Some(result), None)
            }
            Ok(ExecOutcome::TimedOut {
                stdout,
                stderr,
                after,
            }) => {
                let result = JobResult {
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                    exit_code: None,
                    duration_ms: after.as_millis() as u64,
                };
                (
                    JobStatus::TimedOut,
                    Some(result),
                    Some(format!("timed out after {}ms", after.as_millis())),
                )
            }
            Err(err) => (JobStatus::Failed, None, Some(err.to_string())),
        };
        self.transition(job_id, status, |job| {
            job.completed_at = Some(now_ms());
            job.result = result;
            job.error = error;
        })
    }

    pub fn get(&self, job_id: &Uuid) -> Option<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    /// Drops a job that never started, e.g. when no worker could be spawned.
    pub fn discard(&self, job_id: &Uuid) -> Option<Job> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        match jobs.get(job_id) {
            Some(job) if job.status == JobStatus::Queued => jobs.remove(job_id),
            _ => None,
        }
    }

    /// Removes finished jobs whose retention elapsed by `now_ms`.
    pub fn evict_expired(&self, now_ms: u64) -> usize {
        let retention_ms = self.retention.as_millis() as u64;
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|_, job| match job.completed_at {
            Some(done) if job.status.is_terminal() => done.saturating_add(retention_ms) > now_ms,
            _ => true,
        });
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> HashMap<JobStatus, usize> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut counts = HashMap::new();
        for job in jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        counts
    }

    fn transition(
        &self,
        job_id: &Uuid,
        next: JobStatus,
        apply: impl FnOnce(&mut Job),
    ) -> Result<Job, JobsError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs.get_mut(job_id).ok_or(JobsError::NotFound(*job_id))?;
        if !job.status.can_become(next) {
            return Err(JobsError::InvalidTransition {
                job_id: *job_id,
                from: job.status,
                to: next,
            });
        }
        job.status = next;
        apply(job);
        log::info!("job {job_id} -> {next:?}");
        Ok(job.clone())
    }
}
