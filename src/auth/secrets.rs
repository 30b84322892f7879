//! Per-originator, per-key-version HMAC secrets.
//!
//! `StaticSecrets` is fed from configuration. `CachedSecrets` wraps any
//! provider and keeps looked-up secrets in the shared cache, sealed with
//! ChaCha20-Poly1305 under a key that never leaves the process.

use anyhow::{anyhow, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::cache::SharedCache;

pub type Secret = Zeroizing<Vec<u8>>;

/// Matches any originator in a [`SecretEntry`].
pub const ANY_ORIGINATOR: &str = "*";

pub trait SecretProvider: Send + Sync {
    /// `getSecret(originator, keyVersion)`. `Ok(None)` means no such key.
    fn get_secret(&self, originator: &str, key_version: &str) -> Result<Option<Secret>>;
}

#[derive(Clone)]
pub struct SecretEntry {
    pub originator: String,
    pub key_version: String,
    pub secret: Secret,
}

impl SecretEntry {
    pub fn from_hex(originator: &str, key_version: &str, secret_hex: &str) -> Result<Self> {
        let secret = Zeroizing::new(
            hex::decode(secret_hex.trim())
                .map_err(|_| anyhow!("secret for {originator}/{key_version} is not valid hex"))?,
        );
        if secret.len() < 16 {
            return Err(anyhow!(
                "secret for {originator}/{key_version} must be at least 16 bytes"
            ));
        }
        Ok(Self {
            originator: originator.to_string(),
            key_version: key_version.to_string(),
            secret,
        })
    }
}

impl fmt::Debug for SecretEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretEntry")
            .field("originator", &self.originator)
            .field("key_version", &self.key_version)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Default)]
pub struct StaticSecrets {
    entries: HashMap<(String, String), Secret>,
}

impl StaticSecrets {
    pub fn new(entries: impl IntoIterator<Item = SecretEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| ((entry.originator, entry.key_version), entry.secret))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SecretProvider for StaticSecrets {
    fn get_secret(&self, originator: &str, key_version: &str) -> Result<Option<Secret>> {
        let exact = (originator.to_string(), key_version.to_string());
        let wildcard = (ANY_ORIGINATOR.to_string(), key_version.to_string());
        Ok(self
            .entries
            .get(&exact)
            .or_else(|| self.entries.get(&wildcard))
            .cloned())
    }
}

const SECRET_CACHE_TTL: Duration = Duration::from_secs(300);
const SEAL_NONCE_LEN: usize = 12;

pub struct CachedSecrets<P> {
    inner: P,
    cache: Arc<dyn SharedCache>,
    seal_key: Zeroizing<[u8; 32]>,
}

impl<P: SecretProvider> CachedSecrets<P> {
    pub fn new(inner: P, cache: Arc<dyn SharedCache>) -> Self {
        let mut seal_key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut seal_key[..]);
        Self {
            inner,
            cache,
            seal_key,
        }
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.seal_key[..]))
    }

    fn seal(&self, cache_key: &str, secret: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; SEAL_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: secret,
                    aad: cache_key.as_bytes(),
                },
            )
            .map_err(|_| anyhow!("secret sealing failed"))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, cache_key: &str, sealed: &[u8]) -> Result<Secret> {
        if sealed.len() <= SEAL_NONCE_LEN {
            return Err(anyhow!("sealed secret too short"));
        }
        let (nonce, ciphertext) = sealed.split_at(SEAL_NONCE_LEN);
        let plain = self
            .cipher()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: cache_key.as_bytes(),
                },
            )
            .map_err(|_| anyhow!("sealed secret failed to open"))?;
        Ok(Zeroizing::new(plain))
    }
}

impl<P: SecretProvider> SecretProvider for CachedSecrets<P> {
    fn get_secret(&self, originator: &str, key_version: &str) -> Result<Option<Secret>> {
        let cache_key = format!("secret:{originator}:{key_version}");
        match self.cache.get(&cache_key) {
            Ok(Some(sealed)) => match self.open(&cache_key, &sealed) {
                Ok(secret) => return Ok(Some(secret)),
                Err(err) => {
                    // Sealed by another process or a previous run; drop it.
                    log::debug!("discarding cached secret for {originator}: {err}");
                    let _ = self.cache.delete(&cache_key);
                }
            },
            Ok(None) => {}
            Err(err) => log::warn!("secret cache unavailable: {err:#}"),
        }

        let secret = self.inner.get_secret(originator, key_version)?;
        if let Some(secret) = &secret {
            match self.seal(&cache_key, secret) {
                Ok(sealed) => {
                    if let Err(err) = self.cache.set_with_ttl(&cache_key, &sealed, SECRET_CACHE_TTL)
                    {
                        log::warn!("secret cache write failed: {err:#}");
                    }
                }
                Err(err) => log::warn!("secret cache seal failed: {err:#}"),
            }
        }
        Ok(secret)
    }
}
