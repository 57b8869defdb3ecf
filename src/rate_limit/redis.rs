//! Redis-backed admission counter for multi-process coordination.
//!
//! Uses an atomic Lua script so all workers sharing the store respect one
//! fixed window together.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use super::AdmissionBackend;

/// Key prefix for admission counters in Redis.
const KEY_PREFIX: &str = "feedquarry:admission:";

/// Redis-backed fixed-window counter.
pub struct RedisAdmission {
    conn: ConnectionManager,
}

impl RedisAdmission {
    /// Connect to the shared counter store.
    pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn counter_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

#[async_trait]
impl AdmissionBackend for RedisAdmission {
    async fn try_acquire(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();

        // INCR and PEXPIRE must happen atomically: the first caller of a
        // window owns setting its expiry.
        let script = Script::new(
            r#"
            local count = redis.call('INCR', KEYS[1])
            if count == 1 then
                redis.call('PEXPIRE', KEYS[1], ARGV[1])
            end
            if count > tonumber(ARGV[2]) then
                return 0
            end
            return 1
        "#,
        );

        let admitted: i64 = script
            .key(Self::counter_key(key))
            .arg(window.as_millis() as i64)
            .arg(max_requests as i64)
            .invoke_async(&mut conn)
            .await?;

        Ok(admitted == 1)
    }
}

impl Clone for RedisAdmission {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}
