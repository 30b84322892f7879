//! Quantum Gateway
//!
//! A gateway that accepts signed remote commands, authenticates and
//! rate-limits them, validates their shape against declarative schemas, and
//! executes them inside resource-limited sandboxes or stores/retrieves
//! binary artifacts.
//!
//! # Pipeline
//!
//! Every request flows through the same boundary:
//!
//! 1. **Authenticate**: `auth::SignatureVerifier` checks the `Quantum`
//!    authorization header, rate limits, clock skew and nonce replay.
//! 2. **Validate**: `schema::SchemaCache` validates the signed intent
//!    document against `intent.<type>.<version>.json`.
//! 3. **Isolate / execute / store**: `dispatcher::Gateway` routes the typed
//!    intent to `sandbox::SandboxExecutor` or `artifact::ArtifactService`.
//!
//! # Module Structure
//!
//! - `cache`: shared low-latency cache (in-process or Redis)
//! - `db`: durable SQLite store (nonces, auth audit, artifact ledger)
//! - `auth`: header codec, signature verifier, nonce store, rate limiter, secrets
//! - `schema`: schema cache with a load gate
//! - `intent`: closed intent enum and typed manifests
//! - `sandbox`: execution units, limits, streaming
//! - `artifact`: byte store, metadata ledger, access-controlled service
//! - `jobs` / `dispatcher`: job tracking and the orchestrating context
//! - `api`: HTTP front end
//! - `maintenance`: background sweeps

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod artifact;
pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod intent;
pub mod jobs;
pub mod maintenance;
pub mod sandbox;
pub mod schema;

pub use artifact::{ArtifactService, StorageError};
pub use auth::{AuthError, SignatureVerifier, SigningVersion};
pub use cache::{MemoryCache, SharedCache};
pub use config::GatewayConfig;
pub use db::Database;
pub use dispatcher::Gateway;
pub use error::GatewayError;
pub use intent::{Intent, IntentKind};
pub use jobs::{Job, JobStatus};
pub use sandbox::{ExecOutcome, SandboxError, SandboxExecutor};
pub use schema::{SchemaCache, ValidationError};

/// Originator identity used by background tasks. Callers can never claim it:
/// authenticated originators must carry the `rs_` prefix.
pub const SYSTEM_ORIGINATOR: &str = "system";

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:quantum_gateway_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

// -------------------- Clock --------------------

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_s() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Hex SHA-256 of a payload. Used wherever a payload must be referenced in
/// logs or audit rows without being stored.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn shared_memory_uris_are_unique() {
        assert_ne!(shared_memory_uri(), shared_memory_uri());
    }
}
