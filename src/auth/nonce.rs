//! Nonce replay store: shared cache first, durable table second.
//!
//! Both layers are insert-if-absent, so a `(caller, nonce)` pair is consumed
//! exactly once even with several gateway processes. Infrastructure failures
//! reject the request.

use anyhow::Result;
use rusqlite::params;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::SharedCache;
use crate::db::Database;

use super::AuthError;

pub struct NonceStore {
    cache: Arc<dyn SharedCache>,
    db: Arc<Database>,
    ttl: Duration,
}

impl NonceStore {
    pub fn new(cache: Arc<dyn SharedCache>, db: Arc<Database>, ttl: Duration) -> Self {
        Self { cache, db, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Records `nonce` for `caller_id`, failing if it was already used within
    /// the TTL.
    pub fn consume(&self, caller_id: &str, nonce: &str, now_ms: u64) -> Result<(), AuthError> {
        let key = format!("nonce:{caller_id}:{nonce}");
        match self.cache.set_if_absent(&key, b"1", self.ttl) {
            Ok(true) => {}
            Ok(false) => return Err(AuthError::ReplayedNonce),
            Err(err) => {
                log::error!("nonce cache unavailable, rejecting request: {err:#}");
                return Err(AuthError::ReplayCheckUnavailable);
            }
        }

        let now = now_ms as i64;
        let expires_at = now + self.ttl.as_millis() as i64;
        let inserted = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM nonces WHERE caller_id = ?1 AND nonce = ?2 AND expires_at <= ?3",
                params![caller_id, nonce, now],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO nonces(caller_id, nonce, expires_at) VALUES (?1, ?2, ?3)",
                params![caller_id, nonce, expires_at],
            )
        });
        match inserted {
            Ok(1) => Ok(()),
            Ok(_) => Err(AuthError::ReplayedNonce),
            Err(err) => {
                log::error!("durable nonce store unavailable, rejecting request: {err:#}");
                Err(AuthError::ReplayCheckUnavailable)
            }
        }
    }

    /// Deletes durable nonce rows whose TTL has passed.
    pub fn sweep(&self, now_ms: u64) -> Result<usize> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM nonces WHERE expires_at <= ?1",
                params![now_ms as i64],
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::FailingCache;
    use crate::cache::MemoryCache;

    fn store(ttl: Duration) -> Result<(NonceStore, Arc<Database>)> {
        let db = Arc::new(Database::open_in_memory()?);
        Ok((
            NonceStore::new(Arc::new(MemoryCache::new()), db.clone(), ttl),
            db,
        ))
    }

    #[test]
    fn nonce_is_consumed_once_per_caller() -> Result<()> {
        let (nonces, _db) = store(Duration::from_secs(600))?;
        nonces.consume("rs_alice", "n-1", 1_000)?;
        assert!(matches!(
            nonces.consume("rs_alice", "n-1", 1_001),
            Err(AuthError::ReplayedNonce)
        ));
        nonces.consume("rs_bob", "n-1", 1_002)?;
        Ok(())
    }

    #[test]
    fn durable_table_catches_replay_after_cache_loss() -> Result<()> {
        let db = Arc::new(Database::open_in_memory()?);
        let ttl = Duration::from_secs(600);
        NonceStore::new(Arc::new(MemoryCache::new()), db.clone(), ttl).consume("rs_a", "n", 10)?;
        let fresh_cache = NonceStore::new(Arc::new(MemoryCache::new()), db, ttl);
        assert!(matches!(
            fresh_cache.consume("rs_a", "n", 20),
            Err(AuthError::ReplayedNonce)
        ));
        Ok(())
    }

    #[test]
    fn sweep_removes_only_expired_rows() -> Result<()> {
        let (nonces, db) = store(Duration::from_millis(100))?;
        nonces.consume("rs_a", "old", 1_000)?;
        nonces.consume("rs_a", "new", 5_000)?;
        assert_eq!(nonces.sweep(2_000)?, 1);
        let remaining: i64 =
            db.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM nonces", [], |r| r.get(0)))?;
        assert_eq!(remaining, 1);
        Ok(())
    }

    #[test]
    fn cache_failure_fails_closed() -> Result<()> {
        let db = Arc::new(Database::open_in_memory()?);
        let nonces = NonceStore::new(Arc::new(FailingCache), db, Duration::from_secs(60));
        assert!(matches!(
            nonces.consume("rs_a", "n", 1),
            Err(AuthError::ReplayCheckUnavailable)
        ));
        Ok(())
    }
}
