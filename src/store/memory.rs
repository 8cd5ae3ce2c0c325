use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::{resolve_range, CoordinationStore, FieldGuard, Subscription};
use crate::error::{GridError, Result};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.order.remove(&(Score(old), member.to_string()));
        }
        self.order.insert((Score(score), member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.order.remove(&(Score(old), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn pop_first(&mut self) -> Option<(String, f64)> {
        let (score, member) = self.order.pop_first()?;
        self.scores.remove(&member);
        Some((member, score.0))
    }
}

#[derive(Debug)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, StringEntry>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, SortedSet>,
    lists: HashMap<String, VecDeque<String>>,
}

impl State {
    /// Drop the entry if its TTL has elapsed, then return what is left.
    fn live_string(&mut self, key: &str) -> Option<&mut StringEntry> {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|e| e.is_expired(now)) {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }

    fn pop_min(&mut self, key: &str, count: usize) -> Vec<(String, f64)> {
        let mut popped = Vec::new();
        if let Some(set) = self.zsets.get_mut(key) {
            while popped.len() < count {
                match set.pop_first() {
                    Some(entry) => popped.push(entry),
                    None => break,
                }
            }
            if set.scores.is_empty() {
                self.zsets.remove(key);
            }
        }
        popped
    }

    fn pop_front(&mut self, key: &str) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_front();
        if list.is_empty() {
            self.lists.remove(key);
        }
        value
    }
}

/// In-process coordination store.
///
/// TTLs are measured on the Tokio clock, so paused-time tests can expire
/// leases and locks deterministically.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    /// Woken on every list or sorted-set insert so blocking pops can retry.
    inserted: Notify,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `attempt` until it yields a value or `wait` elapses.
    async fn wait_for<T>(
        &self,
        wait: Duration,
        mut attempt: impl FnMut(&mut State) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.inserted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = {
                let mut state = self.state();
                attempt(&mut state)
            };
            if ready.is_some() {
                return ready;
            }
            if wait.is_zero() {
                // Polling loops with no wait must still let other tasks run.
                tokio::task::yield_now().await;
                return None;
            }
            if Instant::now() >= deadline {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, field: &str, raw: &str) -> Result<T> {
    raw.parse().map_err(|_| {
        GridError::Validation(format!("{key}.{field} is not a number: {raw:?}"))
    })
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let entry = StringEntry {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.state().strings.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut state = self.state();
        if state.live_string(key).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state().live_string(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state();
        let live = state.live_string(key).is_some();
        let removed = [
            live && state.strings.remove(key).is_some(),
            state.hashes.remove(key).is_some(),
            state.zsets.remove(key).is_some(),
            state.lists.remove(key).is_some(),
        ];
        Ok(removed.iter().any(|r| *r))
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let mut state = self.state();
        match state.live_string(key) {
            Some(entry) if entry.value == value => {
                state.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut state = self.state();
        match state.live_string(key) {
            Some(entry) => {
                let next = parse_number::<i64>(key, "value", &entry.value)? + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                state.strings.insert(
                    key.to_string(),
                    StringEntry {
                        value: "1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.state().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut state = self.state();
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_create(&self, key: &str, fields: &[(String, String)]) -> Result<bool> {
        let mut state = self.state();
        if state.hashes.contains_key(key) {
            return Ok(false);
        }
        state
            .hashes
            .insert(key.to_string(), fields.iter().cloned().collect());
        Ok(true)
    }

    async fn hash_set_if(
        &self,
        key: &str,
        guards: &[FieldGuard<'_>],
        updates: &[(String, String)],
    ) -> Result<bool> {
        let mut state = self.state();
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(false);
        };
        let holds = guards.iter().all(|(field, allowed)| {
            hash.get(*field)
                .is_some_and(|current| allowed.contains(&current.as_str()))
        });
        if !holds {
            return Ok(false);
        }
        for (field, value) in updates {
            hash.insert(field.clone(), value.clone());
        }
        Ok(true)
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut state = self.state();
        let hash = state.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) => parse_number::<i64>(key, field, raw)?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hash_incr_float(&self, key: &str, field: &str, delta: f64) -> Result<f64> {
        let mut state = self.state();
        let hash = state.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) => parse_number::<f64>(key, field, raw)?,
            None => 0.0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.state()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
        self.inserted.notify_waiters();
        Ok(())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.state();
        let removed = state
            .zsets
            .get_mut(key)
            .is_some_and(|set| set.remove(member));
        if state.zsets.get(key).is_some_and(|set| set.scores.is_empty()) {
            state.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn zset_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self
            .state()
            .zsets
            .get(key)
            .and_then(|set| set.scores.get(member).copied()))
    }

    async fn zset_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let state = self.state();
        let Some(set) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = resolve_range(set.order.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(set
            .order
            .iter()
            .skip(start)
            .take(stop - start + 1)
            .map(|(_, member)| member.clone())
            .collect())
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
        let popped = self
            .wait_for(wait, |state| {
                let batch = state.pop_min(key, count);
                (!batch.is_empty()).then_some(batch)
            })
            .await;
        Ok(popped.unwrap_or_default())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        self.state()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        self.inserted.notify_waiters();
        Ok(())
    }

    async fn list_pop(&self, key: &str, wait: Duration) -> Result<Option<String>> {
        Ok(self.wait_for(wait, |state| state.pop_front(key)).await)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.state().lists.get(key).map_or(0, VecDeque::len))
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let state = self.state();
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = resolve_range(list.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(list
            .iter()
            .skip(start)
            .take(stop - start + 1)
            .cloned()
            .collect())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        Ok(channels
            .get(channel)
            .and_then(|tx| tx.send(message.to_string()).ok())
            .unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let rx = {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        // Lagged receivers skip the messages they missed.
        let stream = BroadcastStream::new(rx).filter_map(|msg| msg.ok());
        Ok(Box::pin(stream))
    }
}
