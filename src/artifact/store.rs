//! Artifact byte store.
//!
//! Layout under the storage root:
//!
//! - `<id>.bin`: published artifact bytes
//! - `.tmp/<id>.<random>.part`: an upload being staged
//! - `.tmp/<id>.<random>.bak`: previous bytes held during a replace
//!
//! Staging hashes while it writes and never holds a whole artifact in
//! memory. Publishing is a hard link, so an existing `<id>.bin` is never
//! overwritten unless the caller asked for a replace.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;
use uuid::Uuid;

use super::StorageError;

const CHUNK: usize = 64 * 1024;
const TMP_DIR: &str = ".tmp";

/// Declared expectations for an upload, checked while streaming.
#[derive(Clone, Debug, Default)]
pub struct StageLimits {
    pub max_bytes: u64,
    pub expected_size: Option<u64>,
    pub expected_sha256: Option<String>,
}

/// Bytes written to a temp file and hashed, not yet visible under their ID.
/// Dropping it removes the temp file.
pub struct StagedArtifact {
    file: NamedTempFile,
    pub size_bytes: u64,
    pub content_hash: String,
}

impl std::fmt::Debug for StagedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedArtifact")
            .field("path", &self.file.path())
            .field("size_bytes", &self.size_bytes)
            .field("content_hash", &self.content_hash)
            .finish()
    }
}

pub struct ArtifactStore {
    root: PathBuf,
    tmp: PathBuf,
    locks: Mutex<HashMap<Uuid, Arc<IdLock>>>,
}

impl ArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let tmp = root.join(TMP_DIR);
        fs::create_dir_all(&tmp)?;
        Ok(Self {
            root,
            tmp,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, artifact_id: &Uuid) -> PathBuf {
        self.root.join(format!("{artifact_id}.bin"))
    }

    pub fn exists(&self, artifact_id: &Uuid) -> bool {
        self.path_of(artifact_id).is_file()
    }

    /// Serializes upload, replace and delete for one ID. Other IDs are not
    /// blocked.
    pub fn lock(&self, artifact_id: &Uuid) -> ArtifactLock<'_> {
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(*artifact_id)
                .or_insert_with(|| Arc::new(IdLock::default()))
                .clone()
        };
        {
            let mut held = slot.held.lock().unwrap_or_else(PoisonError::into_inner);
            while *held {
                held = slot
                    .released
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            *held = true;
        }
        ArtifactLock {
            store: self,
            artifact_id: *artifact_id,
            slot,
        }
    }

    /// Number of IDs with a live lock entry.
    pub fn locked_ids(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Streams `body` into a temp file. Fails with `TooLarge` as soon as the
    /// running size passes `max_bytes`, and checks the declared size and hash
    /// at the end. The temp file is gone on every error path.
    pub fn stage(
        &self,
        artifact_id: &Uuid,
        body: &mut dyn Read,
        limits: &StageLimits,
    ) -> Result<StagedArtifact, StorageError> {
        if let Some(expected) = limits.expected_size {
            if expected > limits.max_bytes {
                return Err(StorageError::TooLarge {
                    limit: limits.max_bytes,
                });
            }
        }
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{artifact_id}."))
            .suffix(".part")
            .tempfile_in(&self.tmp)?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = vec![0u8; CHUNK];
        loop {
            let n = match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            size += n as u64;
            if size > limits.max_bytes {
                log::warn!(
                    "upload {artifact_id} aborted after {size} bytes (limit {})",
                    limits.max_bytes
                );
                return Err(StorageError::TooLarge {
                    limit: limits.max_bytes,
                });
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])?;
        }
        file.as_file().sync_all()?;

        if let Some(expected) = limits.expected_size {
            if expected != size {
                return Err(StorageError::SizeMismatch {
                    expected,
                    actual: size,
                });
            }
        }
        let content_hash = hex::encode(hasher.finalize());
        if let Some(expected) = &limits.expected_sha256 {
            if !expected.eq_ignore_ascii_case(&content_hash) {
                return Err(StorageError::HashMismatch {
                    expected: expected.clone(),
                    actual: content_hash,
                });
            }
        }
        Ok(StagedArtifact {
            file,
            size_bytes: size,
            content_hash,
        })
    }

    /// Makes staged bytes visible as `<id>.bin` unless that name exists.
    pub fn publish(&self, artifact_id: &Uuid, staged: StagedArtifact) -> Result<(), StorageError> {
        let target = self.path_of(artifact_id);
        match fs::hard_link(staged.file.path(), &target) {
            Ok(()) => {
                sync_dir(&self.root);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(StorageError::Conflict(*artifact_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically swaps in staged bytes, keeping the previous bytes until the
    /// returned backup is discarded or restored.
    pub fn replace(
        &self,
        artifact_id: &Uuid,
        staged: StagedArtifact,
    ) -> Result<ReplaceBackup, StorageError> {
        let target = self.path_of(artifact_id);
        let backup = if target.exists() {
            let path = self
                .tmp
                .join(format!("{artifact_id}.{}.bak", Uuid::new_v4().simple()));
            fs::hard_link(&target, &path)?;
            Some(path)
        } else {
            None
        };
        let guard = ReplaceBackup {
            target: target.clone(),
            backup,
            settled: false,
        };
        staged
            .file
            .persist(&target)
            .map_err(|err| StorageError::Io(err.error))?;
        sync_dir(&self.root);
        Ok(guard)
    }

    /// Removes published bytes. `Ok(false)` when there was nothing to remove.
    pub fn remove(&self, artifact_id: &Uuid) -> Result<bool, StorageError> {
        match fs::remove_file(self.path_of(artifact_id)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Opens published bytes for streaming after checking them against the
    /// recorded size and hash. The reader hashes again while streaming.
    pub fn open_verified(
        &self,
        artifact_id: &Uuid,
        expected_size: u64,
        expected_hash: &str,
    ) -> Result<VerifiedReader, StorageError> {
        let path = self.path_of(artifact_id);
        let (size, hash) = match hash_file(&path) {
            Ok(found) => found,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::error!("artifact {artifact_id} has metadata but no bytes");
                return Err(StorageError::Corrupted(*artifact_id));
            }
            Err(err) => return Err(err.into()),
        };
        if size != expected_size || hash != expected_hash {
            log::error!(
                "artifact {artifact_id} failed integrity check (size {size}, hash {hash})"
            );
            return Err(StorageError::Corrupted(*artifact_id));
        }
        Ok(VerifiedReader {
            inner: BufReader::with_capacity(CHUNK, File::open(&path)?),
            hasher: Sha256::new(),
            expected_hash: expected_hash.to_string(),
            finished: false,
        })
    }

    /// Deletes staging leftovers older than `max_age` (crashed uploads).
    pub fn cleanup_stale(&self, max_age: Duration) -> io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in fs::read_dir(&self.tmp)? {
            let entry = entry?;
            let modified = entry.metadata()?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
            }
        }
        if removed > 0 {
            log::info!("removed {removed} stale upload files");
        }
        Ok(removed)
    }

    /// Readiness check: creates and removes a file in the staging dir.
    pub fn check_writable(&self) -> io::Result<()> {
        let mut marker = tempfile::Builder::new()
            .prefix("ready.")
            .suffix(".part")
            .tempfile_in(&self.tmp)?;
        marker.write_all(b"ok")?;
        marker.close()
    }
}

#[derive(Default)]
struct IdLock {
    held: Mutex<bool>,
    released: Condvar,
}

pub struct ArtifactLock<'a> {
    store: &'a ArtifactStore,
    artifact_id: Uuid,
    slot: Arc<IdLock>,
}

impl Drop for ArtifactLock<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .store
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *self.slot.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.slot.released.notify_one();
        // Registry and this guard are the only owners: nobody is waiting.
        if Arc::strong_count(&self.slot) == 2 {
            locks.remove(&self.artifact_id);
        }
    }
}

/// Previous bytes kept aside during a replace. Dropping it discards them.
pub struct ReplaceBackup {
    target: PathBuf,
    backup: Option<PathBuf>,
    settled: bool,
}

impl ReplaceBackup {
    /// Puts the previous bytes back (or removes the new ones when there were
    /// none).
    pub fn restore(mut self) -> io::Result<()> {
        self.settled = true;
        match self.backup.take() {
            Some(backup) => fs::rename(backup, &self.target),
            None => fs::remove_file(&self.target),
        }
    }

    pub fn discard(mut self) {
        self.settled = true;
        self.remove_backup();
    }

    fn remove_backup(&mut self) {
        if let Some(backup) = self.backup.take() {
            if let Err(err) = fs::remove_file(&backup) {
                log::warn!("failed to remove replace backup {}: {err}", backup.display());
            }
        }
    }
}

impl Drop for ReplaceBackup {
    fn drop(&mut self) {
        if !self.settled {
            self.remove_backup();
        }
    }
}

/// Streams artifact bytes, hashing as it goes. Reaching EOF with a digest
/// that differs from the recorded one is an `InvalidData` error.
pub struct VerifiedReader {
    inner: BufReader<File>,
    hasher: Sha256,
    expected_hash: String,
    finished: bool,
}

impl Read for VerifiedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.finished = true;
            let actual = hex::encode(self.hasher.clone().finalize());
            if actual != self.expected_hash {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("artifact content changed while streaming (hash {actual})"),
                ));
            }
            return Ok(0);
        }
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn hash_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((size, hex::encode(hasher.finalize())))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|dir| dir.sync_all()) {
        log::debug!("directory sync failed for {}: {err}", dir.display());
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
