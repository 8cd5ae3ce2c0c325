//! Redis-backed coordination store.
//!
//! Conditional operations run as Lua scripts so the check and the write are
//! one atomic step on the server. Blocking pops hold a pooled connection for
//! at most the requested wait.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use redis::Script;
use tokio_stream::StreamExt;

use super::{CoordinationStore, FieldGuard, Subscription};
use crate::error::{GridError, Result};

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const HASH_CREATE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

// ARGV: guard count g, then per guard its field, allowed count n and n
// allowed values, then field/value pairs.
const HASH_SET_IF: &str = r#"
local pos = 2
for _ = 1, tonumber(ARGV[1]) do
    local current = redis.call('HGET', KEYS[1], ARGV[pos])
    local n = tonumber(ARGV[pos + 1])
    local matched = false
    if current then
        for i = pos + 2, pos + 1 + n do
            if ARGV[i] == current then
                matched = true
                break
            end
        end
    end
    if not matched then
        return 0
    end
    pos = pos + 2 + n
end
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
if #ARGV >= pos then
    redis.call('HSET', KEYS[1], unpack(ARGV, pos))
end
return 1
"#;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: usize,
    /// Prepended to every key and channel so several grids can share a server
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            key_prefix: String::new(),
        }
    }
}

pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
    key_prefix: String,
    delete_if_equals_script: Script,
    hash_create_script: Script,
    hash_set_if_script: Script,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        tracing::info!(url = %config.url, pool_size = config.pool_size, "Connecting to Redis");

        let mut pool_config = Config::from_url(config.url.clone());
        pool_config.pool = Some(PoolConfig::new(config.pool_size));
        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| GridError::Store(format!("failed to create Redis pool: {e}")))?;
        let client = redis::Client::open(config.url.as_str())?;

        let store = Self {
            pool,
            client,
            key_prefix: config.key_prefix.clone(),
            delete_if_equals_script: Script::new(DELETE_IF_EQUALS),
            hash_create_script: Script::new(HASH_CREATE),
            hash_set_if_script: Script::new(HASH_SET_IF),
        };

        let mut conn = store.conn().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(store)
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| GridError::Store(format!("failed to get Redis connection: {e}")))
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .delete_if_equals_script
            .key(self.key(key))
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("INCR")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HGETALL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.key(key));
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<_, i64>(&mut conn).await?;
        Ok(())
    }

    async fn hash_create(&self, key: &str, fields: &[(String, String)]) -> Result<bool> {
        if fields.is_empty() {
            return Err(GridError::Validation(format!(
                "cannot create empty hash {key}"
            )));
        }
        let mut conn = self.conn().await?;
        let mut invocation = self.hash_create_script.prepare_invoke();
        invocation.key(self.key(key));
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        let created: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(created == 1)
    }

    async fn hash_set_if(
        &self,
        key: &str,
        guards: &[FieldGuard<'_>],
        updates: &[(String, String)],
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let mut invocation = self.hash_set_if_script.prepare_invoke();
        invocation.key(self.key(key)).arg(guards.len());
        for (field, allowed) in guards {
            invocation.arg(*field).arg(allowed.len());
            for value in *allowed {
                invocation.arg(*value);
            }
        }
        for (field, value) in updates {
            invocation.arg(field).arg(value);
        }
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HINCRBY")
            .arg(self.key(key))
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await?)
    }

    async fn hash_incr_float(&self, key: &str, field: &str, delta: f64) -> Result<f64> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HINCRBYFLOAT")
            .arg(self.key(key))
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await?)
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("ZADD")
            .arg(self.key(key))
            .arg(score)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("ZREM")
            .arg(self.key(key))
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn zset_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("ZSCORE")
            .arg(self.key(key))
            .arg(member)
            .query_async(&mut conn)
            .await?)
    }

    async fn zset_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("ZRANGE")
            .arg(self.key(key))
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?)
    }

    async fn zset_pop_min(
        &self,
        key: &str,
        count: usize,
        wait: Duration,
    ) -> Result<Vec<(String, f64)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let key = self.key(key);
        let mut conn = self.conn().await?;
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(&key)
            .arg(count)
            .query_async(&mut conn)
            .await?;
        if !popped.is_empty() || wait.is_zero() {
            return Ok(popped);
        }

        // BZPOPMIN takes a single member; top the batch up without waiting.
        let first: Option<(String, String, f64)> = redis::cmd("BZPOPMIN")
            .arg(&key)
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        let Some((_, member, score)) = first else {
            return Ok(Vec::new());
        };
        let mut batch = vec![(member, score)];
        if count > 1 {
            let rest: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
                .arg(&key)
                .arg(count - 1)
                .query_async(&mut conn)
                .await?;
            batch.extend(rest);
        }
        Ok(batch)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("RPUSH")
            .arg(self.key(key))
            .arg(value)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_pop(&self, key: &str, wait: Duration) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        if wait.is_zero() {
            return Ok(redis::cmd("LPOP")
                .arg(self.key(key))
                .query_async(&mut conn)
                .await?);
        }
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(self.key(key))
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("LLEN")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?)
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("LRANGE")
            .arg(self.key(key))
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("PUBLISH")
            .arg(self.key(channel))
            .arg(message)
            .query_async(&mut conn)
            .await?)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.key(channel)).await?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| msg.get_payload::<String>().ok());
        Ok(Box::pin(stream))
    }
}
