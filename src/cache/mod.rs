//! Shared low-latency cache.
//!
//! The nonce store, rate limiter, schema cache, secret cache and artifact
//! ledger all share one cache. Every write is either idempotent or guarded by
//! an atomic primitive (`set_if_absent`, `incr_window`) so several gateway
//! processes can write the same keys concurrently.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[cfg(feature = "redis-cache")]
pub mod redis;

#[cfg(feature = "redis-cache")]
pub use self::redis::RedisCache;

pub trait SharedCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Atomically stores `value` only when `key` is absent (or expired).
    /// Returns `true` when this call created the entry.
    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Increments a fixed-window counter. The window starts with the first
    /// increment and the counter disappears when it ends.
    fn incr_window(&self, key: &str, window: Duration) -> Result<u64>;

    fn delete(&self, key: &str) -> Result<()>;

    fn ping(&self) -> Result<()>;

    /// Reclaims expired entries the backend keeps around. Stores with their
    /// own expiry (Redis) have nothing to do.
    fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Inserts between opportunistic purges of a [`MemoryCache`].
const PURGE_EVERY: usize = 1024;

#[derive(Debug)]
enum Slot {
    Bytes(Vec<u8>),
    Counter(u64),
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process cache. All operations take one mutex, which is what makes
/// `set_if_absent` and `incr_window` atomic.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    inserts: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries held in memory, expired or not.
    pub fn stored(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Counts an insert and purges expired entries every [`PURGE_EVERY`]
    /// inserts, so keys that are never read again do not pile up.
    fn note_insert(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        if (self.inserts.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_EVERY == 0 {
            entries.retain(|_, entry| entry.live(now));
        }
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SharedCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| match &entry.slot {
                Slot::Bytes(bytes) => bytes.clone(),
                Slot::Counter(count) => count.to_string().into_bytes(),
            }))
    }

    fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Bytes(value.to_vec()),
                expires_at: now + ttl,
            },
        );
        self.note_insert(&mut entries, now);
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|entry| entry.live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Bytes(value.to_vec()),
                expires_at: now + ttl,
            },
        );
        self.note_insert(&mut entries, now);
        Ok(true)
    }

    fn incr_window(&self, key: &str, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(key) {
            Some(Entry {
                slot: Slot::Counter(count),
                expires_at,
            }) if *expires_at > now => {
                *count += 1;
                Ok(*count)
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        slot: Slot::Counter(1),
                        expires_at: now + window,
                    },
                );
                self.note_insert(&mut entries, now);
                Ok(1)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.live(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::SharedCache;
    use anyhow::{anyhow, Result};
    use std::time::Duration;

    /// A cache whose every call fails, for exercising fail-open and
    /// fail-closed paths.
    pub struct FailingCache;

    impl SharedCache for FailingCache {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(anyhow!("cache down"))
        }
        fn set_with_ttl(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
            Err(anyhow!("cache down"))
        }
        fn set_if_absent(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<bool> {
            Err(anyhow!("cache down"))
        }
        fn incr_window(&self, _key: &str, _window: Duration) -> Result<u64> {
            Err(anyhow!("cache down"))
        }
        fn delete(&self, _key: &str) -> Result<()> {
            Err(anyhow!("cache down"))
        }
        fn ping(&self) -> Result<()> {
            Err(anyhow!("cache down"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_if_absent_only_succeeds_once() -> Result<()> {
        let cache = MemoryCache::new();
        assert!(cache.set_if_absent("nonce:a", b"1", Duration::from_secs(60))?);
        assert!(!cache.set_if_absent("nonce:a", b"1", Duration::from_secs(60))?);
        assert!(cache.set_if_absent("nonce:b", b"1", Duration::from_secs(60))?);
        Ok(())
    }

    #[test]
    fn expired_entries_are_invisible_and_reclaimable() -> Result<()> {
        let cache = MemoryCache::new();
        cache.set_with_ttl("k", b"v", Duration::from_millis(10))?;
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("k")?, None);
        assert!(cache.set_if_absent("k", b"v2", Duration::from_secs(5))?);
        assert_eq!(cache.get("k")?, Some(b"v2".to_vec()));
        Ok(())
    }

    #[test]
    fn window_counter_resets_after_window() -> Result<()> {
        let cache = MemoryCache::new();
        let window = Duration::from_millis(40);
        assert_eq!(cache.incr_window("rl", window)?, 1);
        assert_eq!(cache.incr_window("rl", window)?, 2);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.incr_window("rl", window)?, 1);
        Ok(())
    }

    #[test]
    fn concurrent_set_if_absent_has_a_single_winner() {
        let cache = Arc::new(MemoryCache::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    cache
                        .set_if_absent("race", b"x", Duration::from_secs(5))
                        .unwrap_or(false)
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn purge_drops_only_expired() -> Result<()> {
        let cache = MemoryCache::new();
        cache.set_with_ttl("short", b"1", Duration::from_millis(5))?;
        cache.set_with_ttl("long", b"1", Duration::from_secs(60))?;
        std::thread::sleep(Duration::from_millis(20));
        let shared: &dyn SharedCache = &cache;
        assert_eq!(shared.purge_expired()?, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stored(), 1);
        Ok(())
    }

    #[test]
    fn short_lived_keys_do_not_accumulate() -> Result<()> {
        let cache = MemoryCache::new();
        for i in 0..10_000 {
            cache.set_if_absent(&format!("nonce:{i}"), b"1", Duration::from_millis(1))?;
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.len(), 0);
        for i in 0..PURGE_EVERY {
            cache.set_with_ttl(&format!("live:{i}"), b"1", Duration::from_secs(60))?;
        }
        assert!(cache.stored() <= PURGE_EVERY, "{} entries kept", cache.stored());
        Ok(())
    }
}
