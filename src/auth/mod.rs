//! Signature authentication with replay defense and rate limiting.
//!
//! `SignatureVerifier::verify` runs the checks in a fixed order:
//!
//! 1. parse the `Quantum` authorization header
//! 2. extract `originator` from the signed document
//! 3. per-originator and per-IP rate limits (fail open)
//! 4. clock skew
//! 5. nonce replay (fail closed)
//! 6. secret lookup for `(originator, keyVersion)`
//! 7. recompute the canonical signing input
//! 8. constant-time signature comparison
//!
//! Every attempt is written to the `auth_events` table and the `audit` log
//! target with a SHA-256 of the payload, never the payload or the secret.

use rusqlite::params;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::cache::SharedCache;
use crate::db::Database;
use crate::{now_ms, sha256_hex};

pub mod header;
pub mod nonce;
pub mod rate_limit;
pub mod secrets;

pub use header::{
    compute_signature, sign_request, signing_input, AuthHeader, SigningVersion, AUTH_SCHEME,
};
pub use nonce::NonceStore;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use secrets::{CachedSecrets, SecretEntry, SecretProvider, StaticSecrets};

pub const ORIGINATOR_PREFIX: &str = "rs_";
const MAX_ORIGINATOR_LEN: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingHeader,
    #[error("malformed authorization header: {0}")]
    MalformedHeader(String),
    #[error("invalid originator: {0}")]
    InvalidOriginator(String),
    #[error("rate limit exceeded ({0})")]
    RateLimited(&'static str),
    #[error("timestamp outside allowed clock skew")]
    ExpiredTimestamp,
    #[error("nonce already used")]
    ReplayedNonce,
    #[error("replay protection unavailable")]
    ReplayCheckUnavailable,
    #[error("unknown signing key")]
    UnknownKey,
    #[error("signature mismatch")]
    BadSignature,
}

impl AuthError {
    /// Short machine-readable reason, stored in the audit trail.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingHeader => "missing_header",
            AuthError::MalformedHeader(_) => "malformed_header",
            AuthError::InvalidOriginator(_) => "invalid_originator",
            AuthError::RateLimited(_) => "rate_limited",
            AuthError::ExpiredTimestamp => "expired_timestamp",
            AuthError::ReplayedNonce => "replayed_nonce",
            AuthError::ReplayCheckUnavailable => "replay_check_unavailable",
            AuthError::UnknownKey => "unknown_key",
            AuthError::BadSignature => "bad_signature",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthSettings {
    pub clock_skew: Duration,
    pub nonce_ttl: Duration,
    pub rate_limits: RateLimitConfig,
    pub default_key_version: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            clock_skew: Duration::from_secs(300),
            nonce_ttl: Duration::from_secs(600),
            rate_limits: RateLimitConfig::default(),
            default_key_version: "v1".to_string(),
        }
    }
}

/// One inbound request as seen by the verifier. `document` is the exact byte
/// string that was signed as RAW_BODY.
#[derive(Clone, Copy, Debug)]
pub struct SignedRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub authorization: Option<&'a str>,
    pub key_version: Option<&'a str>,
    pub document: &'a [u8],
    pub client_ip: IpAddr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedCaller {
    pub originator: String,
    pub key_version: String,
    pub signing_version: SigningVersion,
    pub nonce: String,
}

pub struct SignatureVerifier {
    settings: AuthSettings,
    rate_limiter: RateLimiter,
    nonces: NonceStore,
    secrets: Arc<dyn SecretProvider>,
    db: Arc<Database>,
}

impl SignatureVerifier {
    pub fn new(
        settings: AuthSettings,
        cache: Arc<dyn SharedCache>,
        db: Arc<Database>,
        secrets: Arc<dyn SecretProvider>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(cache.clone(), settings.rate_limits);
        let nonces = NonceStore::new(cache, db.clone(), settings.nonce_ttl);
        Self {
            settings,
            rate_limiter,
            nonces,
            secrets,
            db,
        }
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    pub fn nonces(&self) -> &NonceStore {
        &self.nonces
    }

    pub fn verify(&self, request: &SignedRequest<'_>) -> Result<VerifiedCaller, AuthError> {
        self.verify_at(request, now_ms())
    }

    pub fn verify_at(
        &self,
        request: &SignedRequest<'_>,
        now_ms: u64,
    ) -> Result<VerifiedCaller, AuthError> {
        let mut originator = None;
        let result = self.run_checks(request, now_ms, &mut originator);
        self.audit(request, originator.as_deref(), &result);
        result
    }

    fn run_checks(
        &self,
        request: &SignedRequest<'_>,
        now_ms: u64,
        originator_out: &mut Option<String>,
    ) -> Result<VerifiedCaller, AuthError> {
        let header: AuthHeader = request
            .authorization
            .ok_or(AuthError::MissingHeader)?
            .parse()?;

        let originator = extract_originator(request.document)?;
        *originator_out = Some(originator.clone());

        self.rate_limiter.check(&originator, request.client_ip)?;

        let skew_ms = self.settings.clock_skew.as_millis() as i128;
        if (now_ms as i128 - header.timestamp_ms as i128).abs() > skew_ms {
            return Err(AuthError::ExpiredTimestamp);
        }

        self.nonces.consume(&originator, &header.nonce, now_ms)?;

        let key_version = request
            .key_version
            .unwrap_or(self.settings.default_key_version.as_str())
            .to_string();
        let secret = match self.secrets.get_secret(&originator, &key_version) {
            Ok(Some(secret)) => secret,
            Ok(None) => return Err(AuthError::UnknownKey),
            Err(err) => {
                log::error!("secret lookup failed for {originator}: {err:#}");
                return Err(AuthError::UnknownKey);
            }
        };

        let input = signing_input(
            header.version,
            request.method,
            request.path,
            header.timestamp_ms,
            &header.nonce,
            request.document,
        );
        let expected = compute_signature(&secret, &input);
        if !bool::from(expected.as_slice().ct_eq(header.signature.as_slice())) {
            return Err(AuthError::BadSignature);
        }

        Ok(VerifiedCaller {
            originator,
            key_version,
            signing_version: header.version,
            nonce: header.nonce,
        })
    }

    fn audit(
        &self,
        request: &SignedRequest<'_>,
        originator: Option<&str>,
        result: &Result<VerifiedCaller, AuthError>,
    ) {
        let payload_sha256 = sha256_hex(request.document);
        let (outcome, reason) = match result {
            Ok(_) => ("accepted", None),
            Err(err) => ("rejected", Some(err.reason())),
        };
        let key_version = result.as_ref().ok().map(|caller| caller.key_version.as_str());
        log::info!(
            target: "audit",
            "auth {outcome} originator={} method={} endpoint={} ip={} payload_sha256={} reason={}",
            originator.unwrap_or("-"),
            request.method,
            request.path,
            request.client_ip,
            payload_sha256,
            reason.unwrap_or("-"),
        );
        let written = self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO auth_events(created_at, originator, endpoint, method, outcome, reason,
                                        client_ip, payload_sha256, key_version)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    now_ms() as i64,
                    originator,
                    request.path,
                    request.method,
                    outcome,
                    reason,
                    request.client_ip.to_string(),
                    payload_sha256,
                    key_version,
                ],
            )
        });
        if let Err(err) = written {
            log::error!("failed to persist auth audit event: {err:#}");
        }
    }
}

/// Reads `originator` from a JSON document. It must be a string starting
/// with `rs_`.
pub fn extract_originator(document: &[u8]) -> Result<String, AuthError> {
    let value: Value = serde_json::from_slice(document)
        .map_err(|_| AuthError::InvalidOriginator("document is not JSON".to_string()))?;
    let originator = value
        .get("originator")
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::InvalidOriginator("missing originator".to_string()))?;
    if !originator.starts_with(ORIGINATOR_PREFIX)
        || originator.len() <= ORIGINATOR_PREFIX.len()
        || originator.len() > MAX_ORIGINATOR_LEN
        || originator.chars().any(char::is_whitespace)
    {
        return Err(AuthError::InvalidOriginator(
            "originator must start with rs_".to_string(),
        ));
    }
    Ok(originator.to_string())
}
