//! Redis-backed shared cache (feature `redis-cache`).
//!
//! Uses the synchronous client. One connection is shared behind a mutex and
//! dropped after any error so the next call reconnects.

use anyhow::{anyhow, Context, Result};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::SharedCache;

pub struct RedisCache {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
}

impl RedisCache {
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(
                self.client
                    .get_connection()
                    .context("redis connection failed")?,
            );
        }
        let conn = slot
            .as_mut()
            .ok_or_else(|| anyhow!("redis connection unavailable"))?;
        match f(conn) {
            Ok(value) => Ok(value),
            Err(err) => {
                *slot = None;
                Err(anyhow!("redis command failed: {err}"))
            }
        }
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl SharedCache for RedisCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.with_conn(|conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms(ttl))
                .query(conn)
        })
    }

    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let reply: Option<String> = self.with_conn(|conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms(ttl))
                .query(conn)
        })?;
        Ok(reply.is_some())
    }

    fn incr_window(&self, key: &str, window: Duration) -> Result<u64> {
        let (count,): (u64,) = self.with_conn(|conn| {
            redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(key)
                .arg(0)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms(window))
                .ignore()
                .cmd("INCR")
                .arg(key)
                .query(conn)
        })?;
        Ok(count)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| redis::cmd("DEL").arg(key).query(conn))
    }

    fn ping(&self) -> Result<()> {
        let reply: String = self.with_conn(|conn| redis::cmd("PING").query(conn))?;
        if reply != "PONG" {
            return Err(anyhow!("unexpected redis ping reply"));
        }
        Ok(())
    }
}
