//! Access-controlled artifact storage.
//!
//! [`ArtifactService`] coordinates the byte [`store`] and the metadata
//! [`ledger`]. For one artifact ID, upload, replace and delete run under the
//! ID's lock, bytes are always written before metadata, and a failed ledger
//! write rolls the bytes back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::cache::SharedCache;
use crate::{now_s, SYSTEM_ORIGINATOR};

pub mod ledger;
pub mod store;

pub use ledger::{
    Access, AccessControl, ArtifactMetadata, ArtifactQuery, ArtifactUpdate, AuditEntry, Ledger,
    LedgerStats, SortField, SortOrder,
};
pub use store::{ArtifactStore, StageLimits, VerifiedReader};

pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_ARTIFACT_COUNT: u64 = 10_000;
pub const DEFAULT_ORIGINATOR_QUOTA_BYTES: u64 = 1024 * 1024 * 1024;
pub const STALE_UPLOAD_AGE: Duration = Duration::from_secs(60 * 60);
const METRICS_KEY: &str = "artifact:metrics";
const METRICS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("artifact {0} not found")]
    NotFound(Uuid),
    #[error("access to artifact {0} denied")]
    AccessDenied(Uuid),
    #[error("artifact {0} has expired")]
    Expired(Uuid),
    #[error("artifact {0} already exists")]
    Conflict(Uuid),
    #[error("artifact exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error("declared size {expected} does not match received {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("declared sha256 {expected} does not match received {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("artifact {0} failed its integrity check")]
    Corrupted(Uuid),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger error: {0}")]
    Ledger(String),
}

impl From<anyhow::Error> for StorageError {
    fn from(err: anyhow::Error) -> Self {
        StorageError::Ledger(format!("{err:#}"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArtifactLimits {
    pub max_artifact_bytes: u64,
    pub max_artifact_count: u64,
    pub originator_quota_bytes: u64,
}

impl Default for ArtifactLimits {
    fn default() -> Self {
        Self {
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
            max_artifact_count: DEFAULT_MAX_ARTIFACT_COUNT,
            originator_quota_bytes: DEFAULT_ORIGINATOR_QUOTA_BYTES,
        }
    }
}

/// Upload parameters as they arrive in a `storeArtifact` manifest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadOptions {
    pub artifact_id: Option<Uuid>,
    pub replace: bool,
    pub mime_type: Option<String>,
    pub tags: Map<String, Value>,
    pub access_control: AccessControl,
    pub expires_in_seconds: Option<u64>,
    pub expected_size: Option<u64>,
    pub expected_sha256: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactReceipt {
    pub artifact_id: Uuid,
    pub size_bytes: u64,
    pub content_hash: String,
    pub replaced: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryPage {
    pub artifacts: Vec<ArtifactMetadata>,
    pub limit: u32,
    pub offset: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetrics {
    pub uploads: u64,
    pub downloads: u64,
    pub deletes: u64,
    pub rejected_uploads: u64,
    pub bytes_stored: u64,
}

#[derive(Default)]
struct Counters {
    uploads: AtomicU64,
    downloads: AtomicU64,
    deletes: AtomicU64,
    rejected_uploads: AtomicU64,
    bytes_stored: AtomicU64,
}

pub struct ArtifactService {
    store: ArtifactStore,
    ledger: Ledger,
    cache: Arc<dyn SharedCache>,
    limits: ArtifactLimits,
    counters: Counters,
    // Serializes quota checks with the commits they admit. Held per commit,
    // never while a body streams in.
    quota: Mutex<()>,
}

impl ArtifactService {
    pub fn new(
        store: ArtifactStore,
        ledger: Ledger,
        cache: Arc<dyn SharedCache>,
        limits: ArtifactLimits,
    ) -> Self {
        Self {
            store,
            ledger,
            cache,
            limits,
            counters: Counters::default(),
            quota: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn limits(&self) -> ArtifactLimits {
        self.limits
    }

    pub fn upload(
        &self,
        requester: &str,
        options: &UploadOptions,
        body: &mut dyn Read,
    ) -> Result<ArtifactReceipt, StorageError> {
        let result = self.upload_inner(requester, options, body);
        match &result {
            Ok(receipt) => {
                self.counters.uploads.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_stored
                    .fetch_add(receipt.size_bytes, Ordering::Relaxed);
                log::info!(
                    "artifact {} stored by {requester} ({} bytes{})",
                    receipt.artifact_id,
                    receipt.size_bytes,
                    if receipt.replaced { ", replaced" } else { "" }
                );
            }
            Err(err) => {
                self.counters.rejected_uploads.fetch_add(1, Ordering::Relaxed);
                log::warn!("artifact upload by {requester} rejected: {err}");
            }
        }
        self.publish_metrics();
        result
    }

    fn upload_inner(
        &self,
        requester: &str,
        options: &UploadOptions,
        body: &mut dyn Read,
    ) -> Result<ArtifactReceipt, StorageError> {
        let artifact_id = options.artifact_id.unwrap_or_else(Uuid::new_v4);
        let _lock = self.store.lock(&artifact_id);

        let existing = self.ledger.get(&artifact_id)?;
        if let Some(existing) = &existing {
            if !options.replace {
                return Err(StorageError::Conflict(artifact_id));
            }
            if !existing.permits(requester, Access::Write) {
                return Err(StorageError::AccessDenied(artifact_id));
            }
        }

        // Replaced bytes stay charged to the artifact's owner.
        let owner = existing
            .as_ref()
            .map_or(requester, |meta| meta.originator.as_str())
            .to_string();
        self.check_quota(&owner, existing.as_ref(), options.expected_size.unwrap_or(0))?;

        let staged = self.store.stage(
            &artifact_id,
            body,
            &StageLimits {
                max_bytes: self.limits.max_artifact_bytes,
                expected_size: options.expected_size,
                expected_sha256: options.expected_sha256.clone(),
            },
        )?;

        let _quota = self.quota.lock().unwrap_or_else(PoisonError::into_inner);
        self.check_quota(&owner, existing.as_ref(), staged.size_bytes)?;

        let now = now_s();
        let expires_at = options
            .expires_in_seconds
            .map(|secs| now.saturating_add(i64::try_from(secs).unwrap_or(i64::MAX)));
        let receipt = ArtifactReceipt {
            artifact_id,
            size_bytes: staged.size_bytes,
            content_hash: staged.content_hash.clone(),
            replaced: existing.is_some(),
        };

        match existing {
            None => {
                let meta = ArtifactMetadata {
                    artifact_id,
                    originator: requester.to_string(),
                    size_bytes: staged.size_bytes,
                    content_hash: staged.content_hash.clone(),
                    mime_type: options.mime_type.clone(),
                    created_at: now,
                    expires_at,
                    tags: options.tags.clone(),
                    access_control: options.access_control.clone(),
                    version: 1,
                    last_accessed: None,
                    access_count: 0,
                };
                self.store.publish(&artifact_id, staged)?;
                if let Err(err) = self.ledger.record(&meta, requester) {
                    if let Err(rollback) = self.store.remove(&artifact_id) {
                        log::error!("rollback of artifact {artifact_id} bytes failed: {rollback}");
                    }
                    return Err(err.into());
                }
            }
            Some(previous) => {
                let meta = ArtifactMetadata {
                    size_bytes: staged.size_bytes,
                    content_hash: staged.content_hash.clone(),
                    mime_type: options.mime_type.clone().or(previous.mime_type.clone()),
                    expires_at: expires_at.or(previous.expires_at),
                    tags: if options.tags.is_empty() {
                        previous.tags.clone()
                    } else {
                        options.tags.clone()
                    },
                    ..previous
                };
                let backup = self.store.replace(&artifact_id, staged)?;
                match self.ledger.replace_content(&meta, requester) {
                    Ok(true) => backup.discard(),
                    Ok(false) | Err(_) => {
                        if let Err(rollback) = backup.restore() {
                            log::error!(
                                "restoring previous bytes of {artifact_id} failed: {rollback}"
                            );
                        }
                        return Err(StorageError::Ledger(format!(
                            "metadata for {artifact_id} could not be replaced"
                        )));
                    }
                }
            }
        }
        Ok(receipt)
    }

    /// Count limit for new artifacts and the owner's byte quota. `replacing`
    /// is the copy an upload would overwrite; its bytes are not counted.
    fn check_quota(
        &self,
        owner: &str,
        replacing: Option<&ArtifactMetadata>,
        incoming: u64,
    ) -> Result<(), StorageError> {
        if replacing.is_none() && self.ledger.count()? >= self.limits.max_artifact_count {
            return Err(StorageError::QuotaExceeded(format!(
                "artifact count limit {} reached",
                self.limits.max_artifact_count
            )));
        }
        let reclaimed = replacing.map_or(0, |meta| meta.size_bytes);
        let used = self.ledger.usage_bytes(owner)?.saturating_sub(reclaimed);
        let quota = self.limits.originator_quota_bytes;
        if used >= quota || incoming > quota - used {
            return Err(StorageError::QuotaExceeded(format!(
                "storage quota of {quota} bytes for {owner} exhausted"
            )));
        }
        Ok(())
    }

    /// Fetches metadata and a verifying reader. Missing is `NotFound`, a
    /// requester without read access gets `AccessDenied`, and a readable but
    /// expired artifact is `Expired`.
    pub fn download(
        &self,
        requester: &str,
        artifact_id: &Uuid,
    ) -> Result<(ArtifactMetadata, VerifiedReader), StorageError> {
        let meta = self
            .ledger
            .get(artifact_id)?
            .ok_or(StorageError::NotFound(*artifact_id))?;
        if !meta.permits(requester, Access::Read) {
            log::warn!("{requester} denied read of artifact {artifact_id}");
            return Err(StorageError::AccessDenied(*artifact_id));
        }
        let now = now_s();
        if meta.is_expired(now) {
            return Err(StorageError::Expired(*artifact_id));
        }
        let reader = self
            .store
            .open_verified(artifact_id, meta.size_bytes, &meta.content_hash)?;
        if let Err(err) = self.ledger.touch(artifact_id, now) {
            log::warn!("access tracking for {artifact_id} failed: {err:#}");
        }
        self.counters.downloads.fetch_add(1, Ordering::Relaxed);
        self.publish_metrics();
        Ok((meta, reader))
    }

    /// Deletes metadata, then bytes. `Ok(false)` when the artifact does not
    /// exist.
    pub fn delete(&self, requester: &str, artifact_id: &Uuid) -> Result<bool, StorageError> {
        let _lock = self.store.lock(artifact_id);
        let Some(meta) = self.ledger.get(artifact_id)? else {
            return Ok(false);
        };
        if !meta.permits(requester, Access::Write) {
            log::warn!("{requester} denied delete of artifact {artifact_id}");
            return Err(StorageError::AccessDenied(*artifact_id));
        }
        if !self.ledger.delete(artifact_id, requester)? {
            return Ok(false);
        }
        if !self.store.remove(artifact_id)? {
            log::warn!("artifact {artifact_id} had no bytes on disk");
        }
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.publish_metrics();
        log::info!("artifact {artifact_id} deleted by {requester}");
        Ok(true)
    }

    pub fn update(
        &self,
        requester: &str,
        artifact_id: &Uuid,
        changes: &ArtifactUpdate,
    ) -> Result<ArtifactMetadata, StorageError> {
        let _lock = self.store.lock(artifact_id);
        let meta = self
            .ledger
            .get(artifact_id)?
            .ok_or(StorageError::NotFound(*artifact_id))?;
        if !meta.permits(requester, Access::Write) {
            return Err(StorageError::AccessDenied(*artifact_id));
        }
        if changes.is_empty() {
            return Ok(meta);
        }
        self.ledger
            .update(artifact_id, changes, requester)?
            .ok_or(StorageError::NotFound(*artifact_id))
    }

    /// Pages through artifacts the requester may read.
    pub fn query(&self, requester: &str, query: &ArtifactQuery) -> Result<QueryPage, StorageError> {
        let readable_by = (requester != SYSTEM_ORIGINATOR).then_some(requester);
        let artifacts = self.ledger.query(query, readable_by)?;
        Ok(QueryPage {
            artifacts,
            limit: query.effective_limit(),
            offset: query.offset,
        })
    }

    /// Deletes every expired artifact as the system identity.
    pub fn sweep_expired(&self, now_s: i64) -> Result<usize, StorageError> {
        let mut removed = 0;
        for artifact_id in self.ledger.expired(now_s)? {
            match self.delete(SYSTEM_ORIGINATOR, &artifact_id) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => log::error!("expiry sweep failed for {artifact_id}: {err}"),
            }
        }
        if removed > 0 {
            log::info!("expiry sweep removed {removed} artifacts");
        }
        Ok(removed)
    }

    pub fn cleanup_stale_uploads(&self) -> Result<usize, StorageError> {
        Ok(self.store.cleanup_stale(STALE_UPLOAD_AGE)?)
    }

    pub fn metrics(&self) -> ArtifactMetrics {
        ArtifactMetrics {
            uploads: self.counters.uploads.load(Ordering::Relaxed),
            downloads: self.counters.downloads.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            rejected_uploads: self.counters.rejected_uploads.load(Ordering::Relaxed),
            bytes_stored: self.counters.bytes_stored.load(Ordering::Relaxed),
        }
    }

    fn publish_metrics(&self) {
        let result = serde_json::to_vec(&self.metrics())
            .map_err(anyhow::Error::from)
            .and_then(|raw| self.cache.set_with_ttl(METRICS_KEY, &raw, METRICS_TTL));
        if let Err(err) = result {
            log::debug!("artifact metrics not mirrored: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db::Database;
    use anyhow::Result;
    use std::io::Cursor;
    use tempfile::{tempdir, TempDir};

    fn service(limits: ArtifactLimits) -> Result<(ArtifactService, TempDir)> {
        let dir = tempdir()?;
        let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());
        let db = Arc::new(Database::open_in_memory()?);
        let service = ArtifactService::new(
            ArtifactStore::open(dir.path())?,
            Ledger::new(db, cache.clone()),
            cache,
            limits,
        );
        Ok((service, dir))
    }

    fn read_all(mut reader: VerifiedReader) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn upload_then_download_round_trip() -> Result<()> {
        let (svc, _dir) = service(ArtifactLimits::default())?;
        let mut body = Cursor::new(b"payload".to_vec());
        let receipt = svc.upload("rs_a", &UploadOptions::default(), &mut body)?;
        assert_eq!(receipt.content_hash, crate::sha256_hex(b"payload"));
        let (meta, reader) = svc.download("rs_a", &receipt.artifact_id)?;
        assert_eq!(meta.size_bytes, 7);
        assert_eq!(read_all(reader)?, b"payload");
        assert_eq!(svc.ledger().get(&receipt.artifact_id)?.unwrap().access_count, 1);

        let metrics = svc.metrics();
        assert_eq!((metrics.uploads, metrics.downloads), (1, 1));
        let mirrored: ArtifactMetrics =
            serde_json::from_slice(&svc.cache.get(METRICS_KEY)?.unwrap())?;
        assert_eq!(mirrored, metrics);
        Ok(())
    }

    #[test]
    fn existing_id_conflicts_unless_replace() -> Result<()> {
        let (svc, _dir) = service(ArtifactLimits::default())?;
        let id = Uuid::new_v4();
        let opts = UploadOptions {
            artifact_id: Some(id),
            ..UploadOptions::default()
        };
        svc.upload("rs_a", &opts, &mut Cursor::new(b"one".to_vec()))?;
        assert!(matches!(
            svc.upload("rs_a", &opts, &mut Cursor::new(b"two".to_vec())),
            Err(StorageError::Conflict(_))
        ));

        let replace = UploadOptions {
            replace: true,
            ..opts.clone()
        };
        assert!(matches!(
            svc.upload("rs_b", &replace, &mut Cursor::new(b"two".to_vec())),
            Err(StorageError::AccessDenied(_))
        ));
        let receipt = svc.upload("rs_a", &replace, &mut Cursor::new(b"two".to_vec()))?;
        assert!(receipt.replaced);
        let (meta, reader) = svc.download("rs_a", &id)?;
        assert_eq!(meta.version, 2);
        assert_eq!(read_all(reader)?, b"two");
        Ok(())
    }

    #[test]
    fn acl_is_enforced_per_operation() -> Result<()> {
        let (svc, _dir) = service(ArtifactLimits::default())?;
        let opts = UploadOptions {
            access_control: AccessControl {
                read: vec!["rs_reader".to_string()],
                write: vec!["rs_writer".to_string()],
            },
            ..UploadOptions::default()
        };
        let id = svc.upload("rs_owner", &opts, &mut Cursor::new(b"x".to_vec()))?.artifact_id;

        assert!(matches!(svc.download("rs_stranger", &id), Err(StorageError::AccessDenied(_))));
        assert!(matches!(svc.download("rs_writer", &id), Err(StorageError::AccessDenied(_))));
        assert!(svc.download("rs_reader", &id).is_ok());
        assert!(matches!(svc.delete("rs_reader", &id), Err(StorageError::AccessDenied(_))));
        assert!(matches!(
            svc.download("rs_reader", &Uuid::new_v4()),
            Err(StorageError::NotFound(_))
        ));

        let page = svc.query("rs_stranger", &ArtifactQuery::default())?;
        assert!(page.artifacts.is_empty());
        assert_eq!(svc.query("rs_reader", &ArtifactQuery::default())?.artifacts.len(), 1);
        assert_eq!(page.limit, 100);

        assert!(svc.delete("rs_writer", &id)?);
        assert!(!svc.delete("rs_writer", &id)?);
        assert!(!svc.store().exists(&id));
        Ok(())
    }

    #[test]
    fn oversized_upload_writes_no_row() -> Result<()> {
        let (svc, dir) = service(ArtifactLimits {
            max_artifact_bytes: 1024,
            ..ArtifactLimits::default()
        })?;
        let mut body = std::io::repeat(1).take(4096);
        assert!(matches!(
            svc.upload("rs_a", &UploadOptions::default(), &mut body),
            Err(StorageError::TooLarge { limit: 1024 })
        ));
        assert_eq!(svc.ledger().count()?, 0);
        assert_eq!(std::fs::read_dir(dir.path().join(".tmp"))?.count(), 0);
        assert_eq!(svc.metrics().rejected_uploads, 1);
        Ok(())
    }

    #[test]
    fn quotas_are_checked_before_commit() -> Result<()> {
        let (svc, _dir) = service(ArtifactLimits {
            max_artifact_bytes: 1024,
            max_artifact_count: 2,
            originator_quota_bytes: 10,
        })?;
        svc.upload("rs_a", &UploadOptions::default(), &mut Cursor::new(vec![0u8; 8]))?;
        assert!(matches!(
            svc.upload("rs_a", &UploadOptions::default(), &mut Cursor::new(vec![0u8; 3])),
            Err(StorageError::QuotaExceeded(_))
        ));
        svc.upload("rs_b", &UploadOptions::default(), &mut Cursor::new(vec![0u8; 3]))?;
        assert!(matches!(
            svc.upload("rs_c", &UploadOptions::default(), &mut Cursor::new(vec![0u8; 1])),
            Err(StorageError::QuotaExceeded(_))
        ));
        assert_eq!(svc.ledger().count()?, 2);
        Ok(())
    }

    #[test]
    fn concurrent_uploads_cannot_overrun_quotas() -> Result<()> {
        let (svc, _dir) = service(ArtifactLimits {
            max_artifact_count: 1,
            ..ArtifactLimits::default()
        })?;
        let body = vec![0x5Au8; 256 * 1024];
        let successes = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let mut body = Cursor::new(body.clone());
                        svc.upload("rs_a", &UploadOptions::default(), &mut body)
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| handle.join().ok())
                .filter(|result| result.is_ok())
                .count()
        });
        assert_eq!(successes, 1);
        assert_eq!(svc.ledger().count()?, 1);

        let (svc, _dir) = service(ArtifactLimits {
            originator_quota_bytes: 10,
            ..ArtifactLimits::default()
        })?;
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let mut body = Cursor::new(vec![1u8; 4]);
                    let _ = svc.upload("rs_a", &UploadOptions::default(), &mut body);
                });
            }
        });
        assert_eq!(svc.ledger().usage_bytes("rs_a")?, 8);
        Ok(())
    }

    #[test]
    fn replacement_is_charged_to_the_owner() -> Result<()> {
        let (svc, _dir) = service(ArtifactLimits {
            originator_quota_bytes: 10,
            ..ArtifactLimits::default()
        })?;
        let opts = UploadOptions {
            access_control: AccessControl {
                read: Vec::new(),
                write: vec!["rs_w".to_string()],
            },
            ..UploadOptions::default()
        };
        let id = svc.upload("rs_a", &opts, &mut Cursor::new(vec![0u8; 8]))?.artifact_id;
        svc.upload("rs_w", &UploadOptions::default(), &mut Cursor::new(vec![0u8; 8]))?;

        let replace = UploadOptions {
            artifact_id: Some(id),
            replace: true,
            ..UploadOptions::default()
        };
        svc.upload("rs_w", &replace, &mut Cursor::new(vec![1u8; 9]))?;
        assert_eq!(svc.ledger().usage_bytes("rs_a")?, 9);
        assert_eq!(svc.ledger().usage_bytes("rs_w")?, 8);

        assert!(matches!(
            svc.upload("rs_w", &replace, &mut Cursor::new(vec![2u8; 11])),
            Err(StorageError::QuotaExceeded(_))
        ));
        Ok(())
    }

    #[test]
    fn expired_artifacts_are_refused_then_swept() -> Result<()> {
        let (svc, _dir) = service(ArtifactLimits::default())?;
        let id = svc
            .upload(
                "rs_a",
                &UploadOptions {
                    expires_in_seconds: Some(1),
                    ..UploadOptions::default()
                },
                &mut Cursor::new(b"short-lived".to_vec()),
            )?
            .artifact_id;
        svc.ledger().update(
            &id,
            &ArtifactUpdate {
                expires_at: Some(Some(now_s() - 1)),
                ..ArtifactUpdate::default()
            },
            "rs_a",
        )?;
        assert!(matches!(svc.download("rs_a", &id), Err(StorageError::Expired(_))));
        assert_eq!(svc.sweep_expired(now_s())?, 1);
        assert!(matches!(svc.download("rs_a", &id), Err(StorageError::NotFound(_))));
        let trail = svc.ledger().audit_trail(&id)?;
        assert_eq!(trail.last().map(|e| e.changed_by.as_str()), Some(SYSTEM_ORIGINATOR));
        Ok(())
    }

    #[test]
    fn update_requires_write_access() -> Result<()> {
        let (svc, _dir) = service(ArtifactLimits::default())?;
        let id = svc
            .upload("rs_a", &UploadOptions::default(), &mut Cursor::new(b"x".to_vec()))?
            .artifact_id;
        let changes = ArtifactUpdate {
            mime_type: Some("application/json".to_string()),
            ..ArtifactUpdate::default()
        };
        assert!(matches!(
            svc.update("rs_b", &id, &changes),
            Err(StorageError::AccessDenied(_))
        ));
        let meta = svc.update("rs_a", &id, &changes)?;
        assert_eq!(meta.mime_type.as_deref(), Some("application/json"));
        assert_eq!(meta.version, 2);
        Ok(())
    }
}
