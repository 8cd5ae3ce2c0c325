//! Coordination store shared by every grid process.
//!
//! The dispatch core only needs a handful of primitives: strings with TTL
//! (leases and locks), hashes with a compare-and-swap update (job, node and
//! reward records), sorted sets (priority queues, rankings, indexes), lists
//! with a bounded blocking pop (execution and result queues) and pub/sub.
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local, used by tests and single-process runs
//! - [`RedisStore`](redis::RedisStore): shared Redis, behind the `redis` feature

pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::config::RetryConfig;
use crate::error::Result;

pub use memory::MemoryStore;

/// Messages received on a subscribed channel.
pub type Subscription = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A hash field and the values it must hold for a conditional update.
pub type FieldGuard<'a> = (&'a str, &'a [&'a str]);

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Set a string value, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Create a string value only if the key does not exist. Returns `true` on creation.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a key of any type. Returns `true` if something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete a string key only while it still holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;

    async fn incr(&self, key: &str) -> Result<i64>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Create a hash only if the key does not exist. Returns `true` on creation.
    async fn hash_create(&self, key: &str, fields: &[(String, String)]) -> Result<bool>;

    /// Apply `updates` only if every guard field currently holds one of its
    /// allowed values. A missing field matches nothing.
    ///
    /// This is the single-record compare-and-swap every status transition uses.
    async fn hash_set_if(
        &self,
        key: &str,
        guards: &[FieldGuard<'_>],
        updates: &[(String, String)],
    ) -> Result<bool>;

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn hash_incr_float(&self, key: &str, field: &str, delta: f64) -> Result<f64>;

    /// Insert or update a member's score.
    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()>;

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool>;

    async fn zset_score(&self, key: &str, member: &str) -> Result<Option<f64>>;

    /// Members by ascending score (ties by member), inclusive indexes; `-1` is the last.
    async fn zset_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Pop up to `count` lowest-scored members, waiting up to `wait` for one to appear.
    async fn zset_pop_min(
        &self,
        key: &str,
        count: usize,
        wait: Duration,
    ) -> Result<Vec<(String, f64)>>;

    /// Append to the tail of a list.
    async fn list_push(&self, key: &str, value: &str) -> Result<()>;

    /// Pop from the head of a list, waiting up to `wait` for an element.
    async fn list_pop(&self, key: &str, wait: Duration) -> Result<Option<String>>;

    async fn list_len(&self, key: &str) -> Result<usize>;

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Publish to a channel. Returns the number of receivers.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Retry a store operation with a fixed backoff while it fails transiently.
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                tracing::warn!(operation = what, attempt, error = %e, "Transient store error, retrying");
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Resolve Redis-style inclusive range indexes against a length.
pub(crate) fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GridError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn resolve_range_handles_negative_indexes() {
        assert_eq!(resolve_range(5, 0, -1), Some((0, 4)));
        assert_eq!(resolve_range(5, 1, 2), Some((1, 2)));
        assert_eq!(resolve_range(5, -2, -1), Some((3, 4)));
        assert_eq!(resolve_range(5, 3, 100), Some((3, 4)));
        assert_eq!(resolve_range(0, 0, -1), None);
        assert_eq!(resolve_range(5, 4, 2), None);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_configured_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryConfig {
            attempts: 3,
            backoff: Duration::from_millis(10),
        };
        let result: Result<()> = with_retry(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GridError::Store("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryConfig::default(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GridError::Validation("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
