//! Ephemeral key/value backend
//!
//! A small Redis-shaped command surface (hashes, sorted sets, lists, sets,
//! expiry) behind an async trait, with a concurrent in-memory implementation.
//! Expiry is checked lazily on access.

use async_trait::async_trait;
use dashmap::DashMap;
use orbitgate_core::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    /// Atomically add `delta` to an integer field, creating it at zero
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn del(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Returns false when the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Insert or re-score `member`
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;
    /// All members in ascending score order
    async fn zrange(&self, key: &str) -> Result<Vec<(String, f64)>>;
    async fn zcard(&self, key: &str) -> Result<usize>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Push onto the head; returns the new length
    async fn lpush(&self, key: &str, value: &str) -> Result<usize>;
    /// Pop from the tail
    async fn rpop(&self, key: &str) -> Result<Option<String>>;
    /// Pop from the tail, waiting up to `timeout` for a value.
    /// A zero timeout does not wait.
    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>>;
    async fn llen(&self, key: &str) -> Result<usize>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;
}

/// In-process backend
pub struct MemoryBackend {
    hashes: DashMap<String, HashMap<String, String>>,
    zsets: DashMap<String, Vec<(String, f64)>>,
    lists: DashMap<String, VecDeque<String>>,
    sets: DashMap<String, HashSet<String>>,
    expiries: DashMap<String, Instant>,
    pushed: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            hashes: DashMap::new(),
            zsets: DashMap::new(),
            lists: DashMap::new(),
            sets: DashMap::new(),
            expiries: DashMap::new(),
            pushed: Notify::new(),
        }
    }

    fn remove_all(&self, key: &str) -> bool {
        let mut removed = self.hashes.remove(key).is_some();
        removed |= self.zsets.remove(key).is_some();
        removed |= self.lists.remove(key).is_some();
        removed |= self.sets.remove(key).is_some();
        self.expiries.remove(key);
        removed
    }

    /// Drop `key` if its expiry has passed
    fn purge_expired(&self, key: &str) {
        let expired = self
            .expiries
            .get(key)
            .map(|deadline| Instant::now() >= *deadline)
            .unwrap_or(false);
        if expired {
            self.remove_all(key);
        }
    }

    fn key_exists(&self, key: &str) -> bool {
        self.hashes.contains_key(key)
            || self.zsets.contains_key(key)
            || self.lists.contains_key(key)
            || self.sets.contains_key(key)
    }

    fn pop_tail(&self, key: &str) -> Option<String> {
        self.purge_expired(key);
        let (value, now_empty) = {
            let mut list = self.lists.get_mut(key)?;
            let value = list.pop_back();
            (value, list.is_empty())
        };
        if now_empty {
            self.lists.remove_if(key, |_, l| l.is_empty());
        }
        value
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.purge_expired(key);
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.purge_expired(key);
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.purge_expired(key);
        Ok(self.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.purge_expired(key);
        Ok(self.hashes.get(key).map(|h| h.clone()).unwrap_or_default())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.purge_expired(key);
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) if !raw.is_empty() => raw.parse::<i64>().map_err(|_| {
                Error::Store(format!("Field {} of {} is not an integer: {}", field, key, raw))
            })?,
            _ => 0,
        };
        let next = current.saturating_add(delta);
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.remove_all(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.purge_expired(key);
        Ok(self.key_exists(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.purge_expired(key);
        if !self.key_exists(key) {
            return Ok(false);
        }
        self.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        self.purge_expired(key);
        let mut zset = self.zsets.entry(key.to_string()).or_default();
        zset.retain(|(m, _)| m != member);
        let pos = zset
            .iter()
            .position(|(m, s)| *s > score || (*s == score && m.as_str() > member))
            .unwrap_or(zset.len());
        zset.insert(pos, (member.to_string(), score));
        Ok(())
    }

    async fn zrange(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.purge_expired(key);
        Ok(self.zsets.get(key).map(|z| z.clone()).unwrap_or_default())
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        self.purge_expired(key);
        Ok(self.zsets.get(key).map(|z| z.len()).unwrap_or(0))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.purge_expired(key);
        let removed = match self.zsets.get_mut(key) {
            Some(mut zset) => {
                let before = zset.len();
                zset.retain(|(m, _)| m != member);
                zset.len() != before
            }
            None => false,
        };
        self.zsets.remove_if(key, |_, z| z.is_empty());
        Ok(removed)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize> {
        self.purge_expired(key);
        let len = {
            let mut list = self.lists.entry(key.to_string()).or_default();
            list.push_front(value.to_string());
            list.len()
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        Ok(self.pop_tail(key))
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        if timeout.is_zero() {
            return Ok(self.pop_tail(key));
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking so a push between the check and the
            // wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.pop_tail(key) {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.pop_tail(key));
            }
        }
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.purge_expired(key);
        Ok(self.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.purge_expired(key);
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.purge_expired(key);
        let removed = self
            .sets
            .get_mut(key)
            .map(|mut s| s.remove(member))
            .unwrap_or(false);
        self.sets.remove_if(key, |_, s| s.is_empty());
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.purge_expired(key);
        let mut members: Vec<String> = self
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
