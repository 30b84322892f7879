//! Durable SQLite store shared by the nonce fallback, the auth audit trail
//! and the artifact ledger.

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::open_db_connection;

pub struct Database {
    conn: Mutex<Connection>,
    path: String,
}

impl Database {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let db = Self {
            conn: Mutex::new(conn),
            path: db_path.to_string(),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Private in-memory database, one per call.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn ensure_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;
                PRAGMA foreign_keys=ON;

                CREATE TABLE IF NOT EXISTS nonces (
                  caller_id TEXT NOT NULL,
                  nonce TEXT NOT NULL,
                  expires_at INTEGER NOT NULL,
                  PRIMARY KEY (caller_id, nonce)
                );

                CREATE TABLE IF NOT EXISTS auth_events (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  created_at INTEGER NOT NULL,
                  originator TEXT,
                  endpoint TEXT NOT NULL,
                  method TEXT NOT NULL,
                  outcome TEXT NOT NULL,
                  reason TEXT,
                  client_ip TEXT NOT NULL,
                  payload_sha256 TEXT NOT NULL,
                  key_version TEXT
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                  artifact_id TEXT PRIMARY KEY,
                  originator TEXT NOT NULL,
                  size_bytes INTEGER NOT NULL,
                  sha256 TEXT NOT NULL,
                  mime_type TEXT,
                  created_at INTEGER NOT NULL,
                  expires_at INTEGER,
                  tags TEXT NOT NULL DEFAULT '{}',
                  access_control TEXT NOT NULL DEFAULT '{"read":[],"write":[]}',
                  version INTEGER NOT NULL DEFAULT 1,
                  last_accessed INTEGER,
                  access_count INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS artifact_audit (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  artifact_id TEXT NOT NULL,
                  action TEXT NOT NULL,
                  changed_by TEXT NOT NULL,
                  changes TEXT NOT NULL,
                  created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_nonces_expires ON nonces(expires_at);
                CREATE INDEX IF NOT EXISTS idx_auth_events_created ON auth_events(created_at);
                CREATE INDEX IF NOT EXISTS idx_artifacts_originator ON artifacts(originator);
                CREATE INDEX IF NOT EXISTS idx_artifacts_created ON artifacts(created_at);
                CREATE INDEX IF NOT EXISTS idx_artifacts_expires ON artifacts(expires_at);
                CREATE INDEX IF NOT EXISTS idx_audit_artifact ON artifact_audit(artifact_id, id);
                "#,
            )
        })
    }

    /// Runs `f` with the connection held. Keep the closure to a few
    /// statements: every component shares this lock.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn).map_err(|err| anyhow!("database error: {err}"))
    }

    pub fn ping(&self) -> Result<()> {
        let one: i64 = self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get(0)))?;
        if one != 1 {
            return Err(anyhow!("database ping returned {one}"));
        }
        Ok(())
    }
}
