//! Fixed-window rate limiting per originator and per client IP.
//!
//! Counters live in the shared cache. A limiter infrastructure failure lets
//! the request through (logged), so a cache outage does not take the whole
//! gateway down.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::SharedCache;

use super::AuthError;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests per window per originator. Zero disables the check.
    pub per_originator: u64,
    /// Requests per window per client IP. Zero disables the check.
    pub per_ip: u64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_originator: 60,
            per_ip: 100,
            window: DEFAULT_WINDOW,
        }
    }
}

pub struct RateLimiter {
    cache: Arc<dyn SharedCache>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn SharedCache>, config: RateLimitConfig) -> Self {
        Self { cache, config }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Counts one request against both ceilings. Both counters are always
    /// incremented; either one over its ceiling rejects.
    pub fn check(&self, originator: &str, client_ip: IpAddr) -> Result<(), AuthError> {
        let originator_ok = self.hit(
            "originator",
            &format!("rate_limit:originator:{originator}"),
            self.config.per_originator,
        );
        let ip_ok = self.hit(
            "ip",
            &format!("rate_limit:ip:{client_ip}"),
            self.config.per_ip,
        );
        match (originator_ok, ip_ok) {
            (false, _) => Err(AuthError::RateLimited("originator")),
            (_, false) => Err(AuthError::RateLimited("ip")),
            _ => Ok(()),
        }
    }

    fn hit(&self, scope: &'static str, key: &str, limit: u64) -> bool {
        if limit == 0 {
            return true;
        }
        match self.cache.incr_window(key, self.config.window) {
            Ok(count) => count <= limit,
            Err(err) => {
                log::warn!("rate limiter unavailable for {scope} scope, allowing request: {err:#}");
                true
            }
        }
    }
}
