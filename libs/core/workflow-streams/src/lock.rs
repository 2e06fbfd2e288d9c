//! Advisory distributed lock
//!
//! `lock:<key>` holds the owner token with a TTL. Acquire never waits; callers
//! that want to block should retry with their own backoff. Release and extend
//! compare the owner server-side so a lock that expired and was re-acquired
//! by someone else is never touched.

use crate::error::StreamError;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

pub const LOCK_PREFIX: &str = "lock:";

static RELEASE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r"
        if redis.call('get', KEYS[1]) == ARGV[1] then
            return redis.call('del', KEYS[1])
        else
            return 0
        end
        ",
    )
});

static EXTEND_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r"
        if redis.call('get', KEYS[1]) == ARGV[1] then
            return redis.call('pexpire', KEYS[1], ARGV[2])
        else
            return 0
        end
        ",
    )
});

#[derive(Clone)]
pub struct DistributedLock {
    redis: ConnectionManager,
}

impl DistributedLock {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Set `lock:<key>` to `owner` if absent, expiring after `ttl`
    pub async fn acquire_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StreamError> {
        let mut conn = self.redis.clone();

        // SET NX replies nil when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(key))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await?;

        let acquired = reply.is_some();
        debug!(key = %key, owner = %owner, acquired, "Lock acquire");
        Ok(acquired)
    }

    /// Delete the lock if `owner` still holds it
    pub async fn release_lock(&self, key: &str, owner: &str) -> Result<bool, StreamError> {
        let mut conn = self.redis.clone();

        let deleted: i64 = RELEASE_SCRIPT
            .key(lock_key(key))
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %key, owner = %owner, released = deleted == 1, "Lock release");
        Ok(deleted == 1)
    }

    /// Reset the TTL if `owner` still holds the lock
    pub async fn extend_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StreamError> {
        let mut conn = self.redis.clone();

        let extended: i64 = EXTEND_SCRIPT
            .key(lock_key(key))
            .arg(owner)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %key, owner = %owner, extended = extended == 1, "Lock extend");
        Ok(extended == 1)
    }

    /// Current holder, if any
    pub async fn lock_owner(&self, key: &str) -> Result<Option<String>, StreamError> {
        let mut conn = self.redis.clone();
        let owner: Option<String> = redis::cmd("GET")
            .arg(lock_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(owner)
    }

    /// Remaining TTL; `None` when the lock is not held
    pub async fn lock_ttl(&self, key: &str) -> Result<Option<Duration>, StreamError> {
        let mut conn = self.redis.clone();
        let ttl: i64 = redis::cmd("PTTL")
            .arg(lock_key(key))
            .query_async(&mut conn)
            .await?;
        Ok((ttl >= 0).then(|| Duration::from_millis(ttl as u64)))
    }
}

pub fn lock_key(key: &str) -> String {
    format!("{}{}", LOCK_PREFIX, key)
}

// PX rejects 0
fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
