//! Intent schema cache.
//!
//! Schemas are JSON Schema documents named `intent.<type>.v<N>.json` in the
//! schema directory. Lookups go: in-process cache (fresh while the file's
//! mtime is unchanged) → shared cache → file. Concurrent misses for one key
//! are coalesced by a [`LoadGate`], and a file load is pushed back to the
//! shared cache for 24 hours.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;

use crate::cache::SharedCache;
use crate::now_ms;

pub mod load_gate;

pub use load_gate::LoadGate;

pub const SCHEMA_KEY_PATTERN: &str = r"^intent\.[A-Za-z][A-Za-z0-9_]*\.v[0-9]+\.json$";
const SHARED_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown schema '{0}'")]
    UnknownSchema(String),
    #[error("schema '{key}' could not be loaded: {message}")]
    SchemaLoad { key: String, message: String },
    #[error("{message} (at {path})")]
    Invalid { path: String, message: String },
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl ValidationError {
    pub fn path(&self) -> Option<&str> {
        match self {
            ValidationError::Invalid { path, .. } => Some(path),
            _ => None,
        }
    }
}

pub struct CompiledSchema {
    key: String,
    document: Value,
    validator: jsonschema::Validator,
}

impl CompiledSchema {
    pub fn compile(key: &str, document: Value) -> Result<Self, ValidationError> {
        let validator = jsonschema::options()
            .should_validate_formats(true)
            .build(&document)
            .map_err(|err| ValidationError::SchemaLoad {
                key: key.to_string(),
                message: err.to_string(),
            })?;
        Ok(Self {
            key: key.to_string(),
            document,
            validator,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Reports the first failing rule only, located by its JSON pointer.
    pub fn check(&self, data: &Value) -> Result<(), ValidationError> {
        self.validator.validate(data).map_err(|error| {
            let pointer = error.instance_path.to_string();
            ValidationError::Invalid {
                path: if pointer.is_empty() {
                    "/".to_string()
                } else {
                    pointer
                },
                message: error.to_string(),
            }
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchemaStats {
    pub validations: u64,
    pub errors: u64,
    pub last_loaded_ms: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct SharedEntry {
    mtime_ms: Option<u64>,
    schema: Value,
}

struct LocalEntry {
    schema: Arc<CompiledSchema>,
    mtime_ms: Option<u64>,
}

pub struct SchemaCache {
    dir: PathBuf,
    shared: Arc<dyn SharedCache>,
    key_pattern: Regex,
    local: Mutex<HashMap<String, LocalEntry>>,
    gate: LoadGate<String, Arc<CompiledSchema>, ValidationError>,
    stats: Mutex<HashMap<String, SchemaStats>>,
    file_loads: AtomicU64,
}

impl SchemaCache {
    pub fn new(dir: impl Into<PathBuf>, shared: Arc<dyn SharedCache>) -> Result<Self> {
        Ok(Self {
            dir: dir.into(),
            shared,
            key_pattern: Regex::new(SCHEMA_KEY_PATTERN)?,
            local: Mutex::new(HashMap::new()),
            gate: LoadGate::new(),
            stats: Mutex::new(HashMap::new()),
            file_loads: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `validate(data, schemaKey)`.
    pub fn validate(&self, data: &Value, key: &str) -> Result<(), ValidationError> {
        let schema = self.get(key)?;
        let result = schema.check(data);
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry(key.to_string()).or_default();
        entry.validations += 1;
        if result.is_err() {
            entry.errors += 1;
        }
        result
    }

    pub fn get(&self, key: &str) -> Result<Arc<CompiledSchema>, ValidationError> {
        if !self.key_pattern.is_match(key) {
            return Err(ValidationError::UnknownSchema(key.to_string()));
        }
        let path = self.dir.join(key);
        let mtime_ms = file_mtime_ms(&path);
        if let Some(schema) = self.fresh_local(key, mtime_ms) {
            return Ok(schema);
        }
        self.gate
            .load(&key.to_string(), || self.load(key, &path, mtime_ms))
    }

    fn fresh_local(&self, key: &str, mtime_ms: Option<u64>) -> Option<Arc<CompiledSchema>> {
        let local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        local
            .get(key)
            .filter(|entry| entry.mtime_ms == mtime_ms)
            .map(|entry| entry.schema.clone())
    }

    fn load(
        &self,
        key: &str,
        path: &Path,
        mtime_ms: Option<u64>,
    ) -> Result<Arc<CompiledSchema>, ValidationError> {
        // A leader that lost the race with a just-finished load sees it here.
        if let Some(schema) = self.fresh_local(key, mtime_ms) {
            return Ok(schema);
        }

        let shared_key = format!("schema:{key}");
        let from_shared = match self.shared.get(&shared_key) {
            Ok(Some(raw)) => serde_json::from_slice::<SharedEntry>(&raw)
                .ok()
                .filter(|entry| entry.mtime_ms == mtime_ms),
            Ok(None) => None,
            Err(err) => {
                log::warn!("schema shared cache unavailable: {err:#}");
                None
            }
        };

        let schema = match from_shared {
            Some(entry) => {
                log::debug!("schema {key} loaded from shared cache");
                Arc::new(CompiledSchema::compile(key, entry.schema)?)
            }
            None => {
                if mtime_ms.is_none() {
                    return Err(ValidationError::UnknownSchema(key.to_string()));
                }
                self.file_loads.fetch_add(1, Ordering::SeqCst);
                let document = read_schema_file(path).map_err(|err| ValidationError::SchemaLoad {
                    key: key.to_string(),
                    message: format!("{err:#}"),
                })?;
                let schema = Arc::new(CompiledSchema::compile(key, document)?);
                let entry = SharedEntry {
                    mtime_ms,
                    schema: schema.document.clone(),
                };
                match serde_json::to_vec(&entry) {
                    Ok(raw) => {
                        let pushed = self.shared.set_with_ttl(&shared_key, &raw, SHARED_CACHE_TTL);
                        if let Err(err) = pushed {
                            log::warn!("schema {key} not pushed to shared cache: {err:#}");
                        }
                    }
                    Err(err) => log::warn!("schema {key} not serializable: {err}"),
                }
                log::info!("schema {key} loaded from {}", path.display());
                schema
            }
        };

        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.to_string(),
                LocalEntry {
                    schema: schema.clone(),
                    mtime_ms,
                },
            );
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .last_loaded_ms = Some(now_ms());
        Ok(schema)
    }

    /// Drops `key` from the in-process and shared caches.
    pub fn invalidate(&self, key: &str) {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if let Err(err) = self.shared.delete(&format!("schema:{key}")) {
            log::warn!("schema {key} not removed from shared cache: {err:#}");
        }
    }

    /// Schema keys present in the schema directory, sorted.
    pub fn list_schemas(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list schema dir {}", self.dir.display()))?;
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().to_string();
            if self.key_pattern.is_match(&name) {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Loads every schema in the directory. Returns how many compiled.
    pub fn preload(&self) -> Result<usize> {
        let mut loaded = 0;
        for key in self.list_schemas()? {
            match self.get(&key) {
                Ok(_) => loaded += 1,
                Err(err) => log::error!("schema {key} failed to preload: {err}"),
            }
        }
        Ok(loaded)
    }

    pub fn stats(&self) -> HashMap<String, SchemaStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many times a schema was read from disk.
    pub fn file_loads(&self) -> u64 {
        self.file_loads.load(Ordering::SeqCst)
    }
}

fn file_mtime_ms(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_millis() as u64)
}

fn read_schema_file(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schema {}", path.display()))?;
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid schema JSON {}", path.display()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use serde_json::json;
    use std::sync::Barrier;
    use tempfile::tempdir;

    fn write_schema(dir: &Path, key: &str, schema: &Value) -> Result<()> {
        std::fs::write(dir.join(key), serde_json::to_vec_pretty(schema)?)?;
        Ok(())
    }

    fn code_schema() -> Value {
        json!({
            "type": "object",
            "required": ["originator", "manifest"],
            "properties": {
                "originator": {"type": "string", "pattern": "^rs_"},
                "manifest": {
                    "type": "object",
                    "required": ["code"],
                    "properties": {"code": {"type": "string", "minLength": 1}}
                }
            }
        })
    }

    #[test]
    fn reports_first_error_with_its_path() -> Result<()> {
        let dir = tempdir()?;
        write_schema(dir.path(), "intent.runCode.v1.json", &code_schema())?;
        let cache = SchemaCache::new(dir.path(), Arc::new(MemoryCache::new()))?;

        cache.validate(
            &json!({"originator": "rs_a", "manifest": {"code": "x"}}),
            "intent.runCode.v1.json",
        )?;
        let err = cache
            .validate(
                &json!({"originator": "rs_a", "manifest": {"code": ""}}),
                "intent.runCode.v1.json",
            )
            .unwrap_err();
        assert_eq!(err.path(), Some("/manifest/code"));

        let stats = cache.stats();
        let entry = &stats["intent.runCode.v1.json"];
        assert_eq!(entry.validations, 2);
        assert_eq!(entry.errors, 1);
        Ok(())
    }

    #[test]
    fn cold_key_is_loaded_from_disk_once_under_contention() -> Result<()> {
        let dir = tempdir()?;
        write_schema(dir.path(), "intent.runCode.v1.json", &code_schema())?;
        let cache = Arc::new(SchemaCache::new(dir.path(), Arc::new(MemoryCache::new()))?);
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get("intent.runCode.v1.json")
                        .map(|schema| Arc::as_ptr(&schema) as usize)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(cache.file_loads(), 1);
        let first = results[0].clone()?;
        assert!(results.iter().all(|r| r.as_ref() == Ok(&first)));
        Ok(())
    }

    #[test]
    fn second_process_uses_shared_cache() -> Result<()> {
        let dir = tempdir()?;
        write_schema(dir.path(), "intent.runCode.v1.json", &code_schema())?;
        let shared: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());
        let first = SchemaCache::new(dir.path(), shared.clone())?;
        first.get("intent.runCode.v1.json")?;
        let second = SchemaCache::new(dir.path(), shared)?;
        second.get("intent.runCode.v1.json")?;
        assert_eq!(first.file_loads(), 1);
        assert_eq!(second.file_loads(), 0);
        Ok(())
    }

    #[test]
    fn modified_file_is_reloaded() -> Result<()> {
        let dir = tempdir()?;
        let key = "intent.runCode.v1.json";
        write_schema(dir.path(), key, &code_schema())?;
        let cache = SchemaCache::new(dir.path(), Arc::new(MemoryCache::new()))?;
        let doc = json!({"originator": "rs_a", "manifest": {"code": "1"}});
        assert!(cache.validate(&doc, key).is_ok());

        std::thread::sleep(Duration::from_millis(20));
        write_schema(dir.path(), key, &json!({"type": "object", "required": ["missing"]}))?;
        let file = std::fs::File::options().append(true).open(dir.path().join(key))?;
        file.set_modified(std::time::SystemTime::now() + Duration::from_secs(5))?;

        assert!(cache.validate(&doc, key).is_err());
        assert_eq!(cache.file_loads(), 2);
        Ok(())
    }

    #[test]
    fn identical_error_for_missing_and_invalid_keys() -> Result<()> {
        let dir = tempdir()?;
        let cache = SchemaCache::new(dir.path(), Arc::new(MemoryCache::new()))?;
        assert_eq!(
            cache.get("intent.nothing.v1.json").err(),
            Some(ValidationError::UnknownSchema("intent.nothing.v1.json".to_string()))
        );
        assert!(matches!(
            cache.get("../etc/passwd"),
            Err(ValidationError::UnknownSchema(_))
        ));
        std::fs::write(dir.path().join("intent.broken.v1.json"), "{not json")?;
        assert!(matches!(
            cache.get("intent.broken.v1.json"),
            Err(ValidationError::SchemaLoad { .. })
        ));
        Ok(())
    }

    #[test]
    fn preload_lists_only_schema_files() -> Result<()> {
        let dir = tempdir()?;
        write_schema(dir.path(), "intent.runCode.v1.json", &code_schema())?;
        write_schema(dir.path(), "intent.runCommand.v2.json", &code_schema())?;
        std::fs::write(dir.path().join("README.md"), "schemas")?;
        let cache = SchemaCache::new(dir.path(), Arc::new(MemoryCache::new()))?;
        assert_eq!(
            cache.list_schemas()?,
            vec!["intent.runCode.v1.json", "intent.runCommand.v2.json"]
        );
        assert_eq!(cache.preload()?, 2);
        Ok(())
    }
}
